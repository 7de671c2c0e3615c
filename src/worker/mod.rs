//! Offline cache worker.
//!
//! - [`OfflineCacheController`] implements the install/activate/fetch handlers
//! - [`EventDispatcher`] is the host shim that drives them and tracks lifecycle state
//! - `Network` abstracts the network leg so tests can run without sockets

mod controller;
mod dispatch;
mod fetch;
mod network;

#[cfg(test)]
mod testing;

pub use controller::OfflineCacheController;
pub use dispatch::EventDispatcher;
pub use fetch::{FetchRequest, FetchResponse, ResponseSource};
pub use network::HttpNetwork;
