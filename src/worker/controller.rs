//! Offline cache controller: versioned pre-caching plus cache-first fetch.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::dispatch::WorkerEvents;
use super::fetch::{FetchRequest, FetchResponse};
use super::network::Network;
use crate::cache::CacheStorage;
use crate::manifest::{AssetManifest, CacheName};

/// Cache writes that were started after a response was already handed back.
#[derive(Clone, Default)]
struct PendingWrites(Arc<Mutex<JoinSet<()>>>);

impl PendingWrites {
  fn spawn<F>(&self, write: F)
  where
    F: FnOnce() + Send + 'static,
  {
    match self.0.lock() {
      Ok(mut set) => {
        while set.try_join_next().is_some() {}
        set.spawn_blocking(write);
      }
      Err(e) => warn!("Dropping cache write, task set poisoned: {}", e),
    }
  }

  async fn settle(&self) {
    loop {
      let mut set = match self.0.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return,
      };
      if set.is_empty() {
        return;
      }
      while set.join_next().await.is_some() {}
    }
  }
}

/// Controller for one build's cache generation.
///
/// Pre-caches the manifest on install, evicts every other generation on
/// activate, and answers fetches cache-first. Payload assets fetched from the
/// network are written back to the current generation without delaying the
/// response.
pub struct OfflineCacheController<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  manifest: AssetManifest,
  /// Base URL manifest paths are resolved against
  scope: Url,
  pending: PendingWrites,
}

impl<S: CacheStorage, N: Network> OfflineCacheController<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, manifest: AssetManifest, scope: Url) -> Self {
    Self {
      storage,
      network,
      manifest,
      scope,
      pending: PendingWrites::default(),
    }
  }

  /// Resolve a manifest-relative path against the scope.
  pub fn resolve(&self, path: &str) -> Result<FetchRequest> {
    let url = self
      .scope
      .join(path)
      .map_err(|e| eyre!("Invalid asset path {}: {}", path, e))?;
    Ok(FetchRequest::get(url))
  }

  /// Fetch one manifest asset; anything but a 2xx fails the install.
  async fn fetch_for_install(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let response = self.network.fetch(request).await?;
    if !response.is_ok() {
      return Err(eyre!(
        "Failed to pre-cache {}: status {}",
        request.url,
        response.status
      ));
    }
    Ok(response)
  }

  /// Write a copy of a network response into the current generation in the background.
  fn cache_in_background(&self, request: FetchRequest, response: FetchResponse) {
    let storage = Arc::clone(&self.storage);
    let name = self.manifest.cache_name.clone();

    self.pending.spawn(move || {
      // Failures only mean the asset stays uncached
      match storage.put(&name, &request, &response) {
        Ok(()) => debug!(url = %request.url, cache = %name, "cached network response"),
        Err(e) => debug!(url = %request.url, cache = %name, "cache write dropped: {}", e),
      }
    });
  }
}

impl<S: CacheStorage, N: Network> WorkerEvents for OfflineCacheController<S, N> {
  async fn on_install(&self) -> Result<()> {
    let name = &self.manifest.cache_name;
    self.storage.open(name)?;

    let requests = self
      .manifest
      .assets
      .iter()
      .map(|asset| self.resolve(asset))
      .collect::<Result<Vec<_>>>()?;

    let responses = try_join_all(requests.iter().map(|r| self.fetch_for_install(r))).await?;

    let entries: Vec<_> = requests.into_iter().zip(responses).collect();
    self.storage.put_all(name, &entries)?;

    info!(cache = %name, assets = entries.len(), "pre-cached manifest");
    Ok(())
  }

  async fn on_activate(&self) -> Result<Vec<CacheName>> {
    let current = &self.manifest.cache_name;
    let mut evicted = Vec::new();

    for name in self.storage.keys()? {
      if &name != current && self.storage.delete(&name)? {
        info!(cache = %name, "evicted stale cache");
        evicted.push(name);
      }
    }
    self.storage.mark_activated(current)?;

    Ok(evicted)
  }

  fn was_activated(&self) -> Result<bool> {
    self.storage.is_activated(&self.manifest.cache_name)
  }

  async fn on_fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
    // Any store counts, not only the current generation
    if let Some(cached) = self.storage.match_any(&request)? {
      debug!(url = %request.url, cache = %cached.cache_name, "cache hit");
      return Ok(cached.into_response());
    }

    let response = self.network.fetch(&request).await?;

    if response.is_ok() && request.is_cacheable_asset() {
      self.cache_in_background(request, response.clone());
    }

    Ok(response)
  }

  async fn settle(&self) {
    self.pending.settle().await;
  }
}
