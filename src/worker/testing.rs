//! In-process network used by the worker tests.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use super::fetch::{FetchRequest, FetchResponse};
use super::network::Network;

pub const ORIGIN: &str = "http://localhost:3000/";

pub fn scope() -> Url {
  Url::parse(ORIGIN).unwrap()
}

pub fn get(path: &str) -> FetchRequest {
  FetchRequest::get(scope().join(path).unwrap())
}

/// Serves a fixed set of paths; everything else is a 404.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, (u16, Bytes)>>,
  calls: AtomicUsize,
  offline: AtomicBool,
}

impl FakeNetwork {
  pub fn with_files(files: &[(&str, &str)]) -> Self {
    let network = Self::default();
    for (path, body) in files {
      network.serve(path, 200, body);
    }
    network
  }

  pub fn serve(&self, path: &str, status: u16, body: &str) {
    let url = scope().join(path).unwrap().to_string();
    self
      .routes
      .lock()
      .unwrap()
      .insert(url, (status, Bytes::from(body.to_string())));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Network for FakeNetwork {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    let route = self
      .routes
      .lock()
      .unwrap()
      .get(&request.cache_url())
      .cloned();

    Ok(match route {
      Some((status, body)) => FetchResponse::from_network(status, vec![], body),
      None => FetchResponse::from_network(404, vec![], Bytes::from_static(b"Not Found")),
    })
  }
}
