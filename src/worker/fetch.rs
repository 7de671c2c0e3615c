//! Request and response values passed between the page, the controller and the network.

use bytes::Bytes;
use reqwest::Method;
use url::Url;

/// Suffixes of payload assets that are cached after a successful network fetch.
const CACHEABLE_SUFFIXES: [&str; 3] = [".wasm", ".data", ".js"];

/// A resource request made by a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
}

impl FetchRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// URL used as the cache key. Fragments never take part in matching.
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }

  /// Whether a successful response to this request should be stored on the way back.
  ///
  /// Case-sensitive suffix match on the full URL, so `a.js?v=2` and `a.JS` are not eligible.
  pub fn is_cacheable_asset(&self) -> bool {
    let url = self.cache_url();
    CACHEABLE_SUFFIXES
      .iter()
      .any(|suffix| url.ends_with(suffix))
  }
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Served from a cache store without touching the network
  Cache,
  /// Fetched from the network
  Network,
}

/// A response as seen by the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub source: ResponseSource,
}

impl FetchResponse {
  pub fn from_network(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
    Self {
      status,
      headers,
      body,
      source: ResponseSource::Network,
    }
  }

  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
