use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::manifest::{self, AssetManifest};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  /// Origin the cache worker fetches from and resolves manifest paths against
  /// (defaults to the local server)
  pub origin: Option<Url>,
  /// Cache database (defaults to $XDG_DATA_HOME/eosd-web/cache.db)
  pub cache_db: Option<PathBuf>,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
  /// Per-request network timeout; none by default
  pub request_timeout_secs: Option<u64>,
  /// Build variants by name
  pub variants: BTreeMap<String, AssetManifest>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server: ServerConfig::default(),
      origin: None,
      cache_db: None,
      log_file: None,
      request_timeout_secs: None,
      variants: manifest::default_variants(),
    }
  }
}

const DEFAULT_ORIGIN: &str = "http://localhost:3000/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,
  /// Deployment root
  pub root: PathBuf,
  /// Served when a path is not found under root (defaults to root's parent)
  pub fallback: Option<PathBuf>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host: "127.0.0.1".to_string(),
      port: 3000,
      root: PathBuf::from("."),
      fallback: None,
    }
  }
}

impl ServerConfig {
  pub fn fallback_dir(&self) -> PathBuf {
    self
      .fallback
      .clone()
      .unwrap_or_else(|| self.root.join(".."))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./eosd-web.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/eosd-web/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("eosd-web.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("eosd-web").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.variants.is_empty() {
      return Err(eyre!("At least one build variant must be configured"));
    }
    let origin = self.origin()?;
    if origin.cannot_be_a_base() {
      return Err(eyre!("Origin {} cannot be used as a base URL", origin));
    }
    manifest::validate_variants(&self.variants)
  }

  /// Configured origin, or the local server's.
  pub fn origin(&self) -> Result<Url> {
    match &self.origin {
      Some(origin) => Ok(origin.clone()),
      None => Url::parse(DEFAULT_ORIGIN)
        .map_err(|e| eyre!("Invalid default origin {}: {}", DEFAULT_ORIGIN, e)),
    }
  }

  /// Look up a build variant by name.
  pub fn variant(&self, name: &str) -> Result<&AssetManifest> {
    self.variants.get(name).ok_or_else(|| {
      eyre!(
        "Unknown variant {} (known: {})",
        name,
        self.variants.keys().cloned().collect::<Vec<_>>().join(", ")
      )
    })
  }

  pub fn request_timeout(&self) -> Option<Duration> {
    self.request_timeout_secs.map(Duration::from_secs)
  }
}
