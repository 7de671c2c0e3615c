//! Host-side event dispatch for a cache worker.
//!
//! Delivers install, activate and fetch events to a [`WorkerEvents`]
//! implementation and owns the lifecycle state that decides which events are
//! legal. Pages that are not yet controlled bypass the worker entirely.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::fetch::{FetchRequest, FetchResponse};
use super::network::Network;
use crate::manifest::CacheName;

/// Lifecycle handlers of a cache worker.
pub trait WorkerEvents: Send + Sync + 'static {
  /// Populate the current generation. Must be all-or-nothing.
  fn on_install(&self) -> impl Future<Output = Result<()>> + Send;

  /// Remove stale generations and return their names.
  fn on_activate(&self) -> impl Future<Output = Result<Vec<CacheName>>> + Send;

  /// Answer one request from a controlled page.
  fn on_fetch(&self, request: FetchRequest) -> impl Future<Output = Result<FetchResponse>> + Send;

  /// Whether this generation completed activation in an earlier session.
  fn was_activated(&self) -> Result<bool>;

  /// Wait for work started after a response was already returned.
  fn settle(&self) -> impl Future<Output = ()> + Send;
}

/// Lifecycle state of the dispatched worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Not installed yet, or the last install failed
  Installing,
  /// Installed, activation pending
  WaitingToActivate,
  /// Activated; fetches from claimed pages go through the worker
  Active,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::WaitingToActivate => write!(f, "waiting-to-activate"),
      WorkerState::Active => write!(f, "active"),
    }
  }
}

/// Event dispatcher for one worker instance.
pub struct EventDispatcher<W: WorkerEvents, N: Network> {
  worker: Arc<W>,
  /// Used for pages the worker does not control
  network: Arc<N>,
  state: Mutex<WorkerState>,
  claimed: AtomicBool,
}

impl<W: WorkerEvents, N: Network> EventDispatcher<W, N> {
  /// Dispatcher for a freshly registered worker.
  pub fn new(worker: Arc<W>, network: Arc<N>) -> Self {
    Self {
      worker,
      network,
      state: Mutex::new(WorkerState::Installing),
      claimed: AtomicBool::new(false),
    }
  }

  /// Dispatcher for a worker that was installed and activated in an earlier session.
  pub fn resume(worker: Arc<W>, network: Arc<N>) -> Self {
    Self {
      worker,
      network,
      state: Mutex::new(WorkerState::Active),
      claimed: AtomicBool::new(true),
    }
  }

  /// Pick the worker back up if its generation was activated before, otherwise
  /// install (and activate) it now.
  pub async fn start(worker: Arc<W>, network: Arc<N>) -> Result<Self> {
    if worker.was_activated()? {
      return Ok(Self::resume(worker, network));
    }

    let dispatcher = Self::new(worker, network);
    dispatcher.install().await?;
    Ok(dispatcher)
  }

  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(WorkerState::Installing)
  }

  /// Whether open pages currently route their fetches through the worker.
  pub fn is_controlling(&self) -> bool {
    self.claimed.load(Ordering::SeqCst)
  }

  fn set_state(&self, next: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *state = next;
    Ok(())
  }

  /// Install the worker and, on success, activate it right away.
  ///
  /// A failed install leaves the state at `Installing` so a later call can retry.
  pub async fn install(&self) -> Result<Vec<CacheName>> {
    let state = self.state();
    if state != WorkerState::Installing {
      return Err(eyre!("Cannot install a worker that is {}", state));
    }

    if let Err(e) = self.worker.on_install().await {
      warn!("Install failed: {}", e);
      return Err(e);
    }
    self.set_state(WorkerState::WaitingToActivate)?;

    // Never wait for older instances to go away
    self.activate().await
  }

  /// Activate an installed worker: evict stale generations, then claim open pages.
  pub async fn activate(&self) -> Result<Vec<CacheName>> {
    let state = self.state();
    if state != WorkerState::WaitingToActivate {
      return Err(eyre!("Cannot activate a worker that is {}", state));
    }

    let evicted = self.worker.on_activate().await?;
    self.set_state(WorkerState::Active)?;
    self.claim();

    info!(evicted = evicted.len(), "worker active");
    Ok(evicted)
  }

  /// Start controlling pages that were opened before activation.
  fn claim(&self) {
    self.claimed.store(true, Ordering::SeqCst);
  }

  /// Deliver a page request.
  pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
    if self.state() == WorkerState::Active && self.is_controlling() {
      self.worker.on_fetch(request).await
    } else {
      self.network.fetch(&request).await
    }
  }

  /// Deliver a page request on its own task.
  pub fn spawn_fetch(&self, request: FetchRequest) -> tokio::task::JoinHandle<Result<FetchResponse>> {
    let controlled = self.state() == WorkerState::Active && self.is_controlling();
    let worker = Arc::clone(&self.worker);
    let network = Arc::clone(&self.network);

    tokio::spawn(async move {
      if controlled {
        worker.on_fetch(request).await
      } else {
        network.fetch(&request).await
      }
    })
  }

  /// Wait until background cache writes have finished.
  pub async fn settle(&self) {
    self.worker.settle().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, SqliteStorage};
  use crate::manifest::AssetManifest;
  use crate::worker::testing::{get, scope, FakeNetwork};
  use crate::worker::{OfflineCacheController, ResponseSource};

  type Dispatcher = EventDispatcher<OfflineCacheController<SqliteStorage, FakeNetwork>, FakeNetwork>;

  fn dispatcher(
    storage: &Arc<SqliteStorage>,
    network: &Arc<FakeNetwork>,
    name: &str,
    assets: &[&str],
  ) -> Dispatcher {
    let manifest = AssetManifest::new(
      CacheName::new(name).unwrap(),
      assets.iter().map(|a| a.to_string()).collect(),
    )
    .unwrap();
    let worker = OfflineCacheController::new(
      Arc::clone(storage),
      Arc::clone(network),
      manifest,
      scope(),
    );
    EventDispatcher::new(Arc::new(worker), Arc::clone(network))
  }

  fn worker(
    storage: &Arc<SqliteStorage>,
    network: &Arc<FakeNetwork>,
    name: &str,
    assets: &[&str],
  ) -> Arc<OfflineCacheController<SqliteStorage, FakeNetwork>> {
    let manifest = AssetManifest::new(
      CacheName::new(name).unwrap(),
      assets.iter().map(|a| a.to_string()).collect(),
    )
    .unwrap();
    Arc::new(OfflineCacheController::new(
      Arc::clone(storage),
      Arc::clone(network),
      manifest,
      scope(),
    ))
  }

  #[tokio::test]
  async fn test_start_retries_after_failed_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::with_files(&[("a.wasm", "wasm"), ("b.data", "data")]));
    let v1 = CacheName::new("v1").unwrap();
    storage.open(&CacheName::new("v0").unwrap()).unwrap();
    storage.mark_activated(&CacheName::new("v0").unwrap()).unwrap();

    network.set_offline(true);
    let first = EventDispatcher::start(
      worker(&storage, &network, "v1", &["a.wasm", "b.data"]),
      Arc::clone(&network),
    )
    .await;
    assert!(first.is_err());
    // The store exists but is not a usable generation
    assert!(storage.keys().unwrap().contains(&v1));
    assert!(!storage.is_activated(&v1).unwrap());

    network.set_offline(false);
    let sw = EventDispatcher::start(
      worker(&storage, &network, "v1", &["a.wasm", "b.data"]),
      Arc::clone(&network),
    )
    .await
    .unwrap();

    assert_eq!(sw.state(), WorkerState::Active);
    assert_eq!(storage.entries(&v1).unwrap().len(), 2);
    assert_eq!(storage.keys().unwrap(), vec![v1.clone()]);
    assert!(storage.is_activated(&v1).unwrap());
  }

  #[tokio::test]
  async fn test_start_resumes_activated_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::with_files(&[("a.wasm", "wasm")]));
    EventDispatcher::start(worker(&storage, &network, "v1", &["a.wasm"]), Arc::clone(&network))
      .await
      .unwrap();
    let calls = network.calls();

    network.set_offline(true);
    let sw = EventDispatcher::start(worker(&storage, &network, "v1", &["a.wasm"]), Arc::clone(&network))
      .await
      .unwrap();
    let response = sw.fetch(get("a.wasm")).await.unwrap();

    assert_eq!(sw.state(), WorkerState::Active);
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(network.calls(), calls);
  }

  #[tokio::test]
  async fn test_install_activates_immediately() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::with_files(&[("a.wasm", "wasm")]));
    let sw = dispatcher(&storage, &network, "v1", &["a.wasm"]);
    assert_eq!(sw.state(), WorkerState::Installing);
    assert!(!sw.is_controlling());

    sw.install().await.unwrap();

    assert_eq!(sw.state(), WorkerState::Active);
    assert!(sw.is_controlling());
  }

  #[tokio::test]
  async fn test_failed_install_can_be_retried() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::default());
    let sw = dispatcher(&storage, &network, "v1", &["a.wasm"]);

    assert!(sw.install().await.is_err());
    assert_eq!(sw.state(), WorkerState::Installing);

    network.serve("a.wasm", 200, "wasm");
    sw.install().await.unwrap();
    assert_eq!(sw.state(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::default());
    let sw = dispatcher(&storage, &network, "v1", &[]);

    assert!(sw.activate().await.is_err());
    assert_eq!(sw.state(), WorkerState::Installing);
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::with_files(&[("a.wasm", "wasm")]));
    dispatcher(&storage, &network, "v1", &["a.wasm"])
      .install()
      .await
      .unwrap();

    let v2 = dispatcher(&storage, &network, "v2", &["a.wasm", "missing.data"]);
    assert!(v2.install().await.is_err());

    assert!(storage.keys().unwrap().contains(&CacheName::new("v1").unwrap()));
  }

  #[tokio::test]
  async fn test_uncontrolled_fetch_bypasses_worker() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::with_files(&[("a.wasm", "wasm")]));
    let sw = dispatcher(&storage, &network, "v1", &[]);

    let response = sw.fetch(get("a.wasm")).await.unwrap();
    sw.settle().await;

    assert_eq!(response.source, ResponseSource::Network);
    assert!(storage.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_fetches_are_independent() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::with_files(&[
      ("a.wasm", "a"),
      ("b.data", "b"),
      ("c.js", "c"),
      ("index.html", "<html>"),
    ]));
    let sw = dispatcher(&storage, &network, "v1", &[]);
    sw.install().await.unwrap();

    let handles: Vec<_> = ["a.wasm", "b.data", "c.js", "index.html"]
      .into_iter()
      .map(|path| sw.spawn_fetch(get(path)))
      .collect();
    for handle in handles {
      assert_eq!(handle.await.unwrap().unwrap().status, 200);
    }
    sw.settle().await;

    let entries = storage.entries(&CacheName::new("v1").unwrap()).unwrap();
    assert_eq!(entries.len(), 3);
  }

  /// manifest ["a.wasm","b.js"] under v1, then ["a.wasm","c.data"] under v2
  #[tokio::test]
  async fn test_generation_replacement_scenario() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::with_files(&[
      ("a.wasm", "a"),
      ("b.js", "b"),
      ("c.data", "c"),
    ]));

    let v1 = dispatcher(&storage, &network, "v1", &["a.wasm", "b.js"]);
    v1.install().await.unwrap();
    assert_eq!(storage.entries(&CacheName::new("v1").unwrap()).unwrap().len(), 2);

    let calls = network.calls();
    let hit = v1.fetch(get("a.wasm")).await.unwrap();
    assert_eq!(hit.source, ResponseSource::Cache);
    assert_eq!(network.calls(), calls);

    let v2 = dispatcher(&storage, &network, "v2", &["a.wasm", "c.data"]);
    let evicted = v2.install().await.unwrap();

    assert_eq!(evicted, vec![CacheName::new("v1").unwrap()]);
    assert_eq!(storage.keys().unwrap(), vec![CacheName::new("v2").unwrap()]);
    let urls: Vec<_> = storage
      .entries(&CacheName::new("v2").unwrap())
      .unwrap()
      .into_iter()
      .map(|e| e.url)
      .collect();
    assert_eq!(
      urls,
      vec!["http://localhost:3000/a.wasm", "http://localhost:3000/c.data"]
    );
  }
}
