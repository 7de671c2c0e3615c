//! Values read back out of a cache store.

use chrono::{DateTime, Utc};

use crate::manifest::CacheName;
use crate::worker::{FetchResponse, ResponseSource};

/// A stored response found by a cache lookup.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// Store the hit came from
  pub cache_name: CacheName,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: bytes::Bytes,
  /// When the response was written
  pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Hand the stored response back to the page.
  pub fn into_response(self) -> FetchResponse {
    FetchResponse {
      status: self.status,
      headers: self.headers,
      body: self.body,
      source: ResponseSource::Cache,
    }
  }
}

/// Listing row for one stored entry.
#[derive(Debug, Clone)]
pub struct CacheEntrySummary {
  pub method: String,
  pub url: String,
  pub status: u16,
  pub size: usize,
  /// Hex SHA-256 of the stored body
  pub body_sha256: String,
  pub stored_at: DateTime<Utc>,
}
