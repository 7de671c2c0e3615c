//! Static file server for the game build.

use axum::extract::Request;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::Path;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use crate::config::ServerConfig;

const WASM_MIME: &str = "application/wasm";

/// Force the wasm MIME type so streaming compilation works regardless of the guessed type.
async fn wasm_content_type(request: Request, next: Next) -> Response {
  let is_wasm = request.uri().path().ends_with(".wasm");
  let mut response = next.run(request).await;
  if is_wasm && response.status().is_success() {
    response
      .headers_mut()
      .insert(CONTENT_TYPE, HeaderValue::from_static(WASM_MIME));
  }
  response
}

/// Router serving `root`, falling back to `fallback` for paths not found there.
///
/// Every response is cross-origin isolated (COOP + COEP).
pub fn router(root: &Path, fallback: &Path) -> Router {
  let files = ServeDir::new(root).fallback(ServeDir::new(fallback));

  Router::new()
    .fallback_service(files)
    .layer(middleware::from_fn(wasm_content_type))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("cross-origin-opener-policy"),
      HeaderValue::from_static("same-origin"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("cross-origin-embedder-policy"),
      HeaderValue::from_static("require-corp"),
    ))
}

/// Serve the build until the process is stopped.
///
/// # Errors
///
/// Returns an error if the server cannot bind to the configured address.
pub async fn run(config: &ServerConfig) -> Result<()> {
  let fallback = config.fallback_dir();
  let app = router(&config.root, &fallback);

  let addr: SocketAddr = format!("{}:{}", config.host, config.port)
    .parse()
    .map_err(|e| eyre!("Invalid listen address {}:{}: {}", config.host, config.port, e))?;
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  info!(
    root = %config.root.display(),
    fallback = %fallback.display(),
    "Listening on http://{}",
    addr
  );
  axum::serve(listener, app)
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  Ok(())
}
