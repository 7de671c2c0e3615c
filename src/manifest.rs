//! Asset manifests and cache identifiers for each deployed build variant.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Name of one generation of cached assets (e.g. `eosd-v1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheName(String);

impl CacheName {
  pub fn new(name: impl Into<String>) -> Result<Self> {
    let name = name.into();
    if name.trim().is_empty() {
      return Err(eyre!("Cache name must not be empty"));
    }
    Ok(Self(name))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl TryFrom<String> for CacheName {
  type Error = color_eyre::Report;

  fn try_from(value: String) -> Result<Self> {
    Self::new(value)
  }
}

impl From<CacheName> for String {
  fn from(value: CacheName) -> Self {
    value.0
  }
}

impl fmt::Display for CacheName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Ordered list of assets that must be available offline for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
  pub cache_name: CacheName,
  pub assets: Vec<String>,
}

impl AssetManifest {
  #[cfg(test)]
  pub fn new(cache_name: CacheName, assets: Vec<String>) -> Result<Self> {
    let manifest = Self { cache_name, assets };
    manifest.validate()?;
    Ok(manifest)
  }

  /// Reject empty paths and repeated entries.
  pub fn validate(&self) -> Result<()> {
    let mut seen = HashSet::new();
    for asset in &self.assets {
      if asset.trim().is_empty() {
        return Err(eyre!("Manifest {} contains an empty asset path", self.cache_name));
      }
      if !seen.insert(asset.as_str()) {
        return Err(eyre!(
          "Manifest {} lists {} more than once",
          self.cache_name,
          asset
        ));
      }
    }
    Ok(())
  }

  fn for_stem(cache_name: &str, stem: &str) -> Self {
    Self {
      cache_name: CacheName(cache_name.to_string()),
      assets: ["html", "js", "wasm", "data"]
        .iter()
        .map(|ext| format!("{}.{}", stem, ext))
        .collect(),
    }
  }

  /// Debug build of the game.
  pub fn debug() -> Self {
    Self::for_stem("eosd-v1", "th06_debug")
  }

  /// Release build of the game.
  pub fn release() -> Self {
    Self::for_stem("eosd-release-v1", "th06")
  }
}

/// Built-in variants, keyed by the name used on the command line.
pub fn default_variants() -> BTreeMap<String, AssetManifest> {
  BTreeMap::from([
    ("debug".to_string(), AssetManifest::debug()),
    ("release".to_string(), AssetManifest::release()),
  ])
}

/// Validate every manifest and make sure no two variants share a cache name.
pub fn validate_variants(variants: &BTreeMap<String, AssetManifest>) -> Result<()> {
  let mut owners: BTreeMap<&CacheName, &str> = BTreeMap::new();
  for (variant, manifest) in variants {
    manifest.validate()?;
    if let Some(other) = owners.insert(&manifest.cache_name, variant) {
      return Err(eyre!(
        "Variants {} and {} share cache name {}",
        other,
        variant,
        manifest.cache_name
      ));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_variants_are_valid() {
    let variants = default_variants();
    assert!(validate_variants(&variants).is_ok());
    assert_eq!(variants["debug"].cache_name.as_str(), "eosd-v1");
    assert_eq!(
      variants["debug"].assets,
      vec![
        "th06_debug.html",
        "th06_debug.js",
        "th06_debug.wasm",
        "th06_debug.data"
      ]
    );
  }

  #[test]
  fn test_shared_cache_name_rejected() {
    let mut variants = default_variants();
    variants.insert("copy".to_string(), AssetManifest::debug());
    let err = validate_variants(&variants).unwrap_err();
    assert!(err.to_string().contains("eosd-v1"));
  }

  #[test]
  fn test_duplicate_asset_rejected() {
    let name = CacheName::new("v1").unwrap();
    let result = AssetManifest::new(name, vec!["a.wasm".into(), "a.wasm".into()]);
    assert!(result.is_err());
  }

  #[test]
  fn test_empty_cache_name_rejected() {
    assert!(CacheName::new("  ").is_err());
    assert!(serde_yaml::from_str::<CacheName>("''").is_err());
  }
}
