//! Persistent cache stores for offline asset access.
//!
//! This module provides named, versioned stores that:
//! - Map a GET request (method + URL) to a stored response
//! - Can be looked up across every store at once or within one store
//! - Are created on first use and deleted as a whole when their generation goes stale

mod entry;
mod storage;

pub use storage::{CacheStorage, SqliteStorage};
