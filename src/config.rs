use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub tracker: TrackerConfig,
  #[serde(default)]
  pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin all cacheable traffic belongs to; cross-origin requests pass
  /// through the interception layer untouched.
  #[serde(default = "default_base_url")]
  pub base_url: String,
  /// Path prefix that selects the network-first strategy.
  #[serde(default = "default_api_prefix")]
  pub prefix: String,
  /// API routes (path prefixes) whose responses may be stored in the dynamic
  /// generation for offline fallback.
  #[serde(default)]
  pub cacheable_routes: Vec<String>,
  /// Remote preferences endpoint (journey state read/write).
  #[serde(default = "default_preferences_path")]
  pub preferences_path: String,
  /// Remote "next recommended action" endpoint.
  #[serde(default = "default_next_action_path")]
  pub next_action_path: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      prefix: default_api_prefix(),
      cacheable_routes: Vec::new(),
      preferences_path: default_preferences_path(),
      next_action_path: default_next_action_path(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version tag baked into generation names. Bumping it makes `activate`
  /// discard every generation carrying the old tag.
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Shell resources precached into the static generation during install.
  #[serde(default)]
  pub precache: Vec<String>,
  /// Path of the document served when a cache-first request fails entirely.
  #[serde(default = "default_offline_document")]
  pub offline_document: String,
}

impl CacheConfig {
  pub fn static_generation(&self) -> String {
    format!("static-{}", self.version)
  }

  pub fn dynamic_generation(&self) -> String {
    format!("dynamic-{}", self.version)
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      precache: Vec::new(),
      offline_document: default_offline_document(),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrackerConfig {
  /// EWMA smoothing factor; applied globally rather than per endpoint class.
  #[serde(default = "default_smoothing")]
  pub smoothing: f64,
  /// Estimate returned for endpoints with no history.
  #[serde(default = "default_estimate_ms")]
  pub default_estimate_ms: u64,
  /// Floor applied to observed durations so zero-duration samples cannot
  /// collapse the estimate.
  #[serde(default = "default_min_sample_ms")]
  pub min_sample_ms: u64,
  /// Ceiling the ETA is mapped against when deriving a progress percentage.
  #[serde(default = "default_eta_ceiling_ms")]
  pub eta_ceiling_ms: u64,
  /// Progress never drops below this while requests are pending, so the
  /// indicator never appears stalled at 0%.
  #[serde(default = "default_min_progress")]
  pub min_progress: u8,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      smoothing: default_smoothing(),
      default_estimate_ms: default_estimate_ms(),
      min_sample_ms: default_min_sample_ms(),
      eta_ceiling_ms: default_eta_ceiling_ms(),
      min_progress: default_min_progress(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Database location; defaults to the platform data directory.
  pub path: Option<PathBuf>,
}

fn default_base_url() -> String {
  "https://app.example.com".to_string()
}

fn default_api_prefix() -> String {
  "/api".to_string()
}

fn default_preferences_path() -> String {
  "/api/preferences".to_string()
}

fn default_next_action_path() -> String {
  "/api/next-action".to_string()
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_offline_document() -> String {
  "/offline.html".to_string()
}

fn default_smoothing() -> f64 {
  0.3
}

fn default_estimate_ms() -> u64 {
  800
}

fn default_min_sample_ms() -> u64 {
  10
}

fn default_eta_ceiling_ms() -> u64 {
  10_000
}

fn default_min_progress() -> u8 {
  5
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./holdfast.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/holdfast/config.yaml
  /// 4. ~/.config/holdfast/config.yaml
  ///
  /// Falls back to defaults when no file exists and no explicit path was
  /// given.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("holdfast.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("holdfast").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the remote API token from environment variables.
  ///
  /// Checks HOLDFAST_API_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HOLDFAST_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_usable() {
    let config = Config::default();
    assert_eq!(config.api.prefix, "/api");
    assert_eq!(config.cache.static_generation(), "static-v1");
    assert_eq!(config.cache.dynamic_generation(), "dynamic-v1");
    assert_eq!(config.tracker.default_estimate_ms, 800);
  }

  #[test]
  fn parses_partial_yaml() {
    let yaml = r#"
api:
  base_url: https://learn.example.org
  cacheable_routes:
    - /api/topics
    - /api/bookmarks
cache:
  version: v7
  precache:
    - /
    - /offline.html
"#;

    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.api.base_url, "https://learn.example.org");
    assert_eq!(config.api.cacheable_routes.len(), 2);
    assert_eq!(config.cache.static_generation(), "static-v7");
    // Untouched sections keep their defaults
    assert_eq!(config.tracker.min_progress, 5);
  }
}
