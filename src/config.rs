use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const APP_DIR: &str = "storefront-kv";

/// Resolved configuration, ready to build stores from.
#[derive(Debug, Clone)]
pub struct Config {
  pub remote: RemoteConfig,
  pub breaker: BreakerConfig,
  pub local: LocalConfig,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
  /// KV worker endpoint
  pub url: Url,
  pub timeout_ms: u64,
}

impl RemoteConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct BreakerConfig {
  /// Consecutive failures that open the breaker
  #[serde(default = "default_max_failures")]
  pub max_failures: u32,
  /// Cooldown before a probe is allowed through an open breaker
  #[serde(default = "default_reset_timeout_ms")]
  pub reset_timeout_ms: u64,
}

impl BreakerConfig {
  pub fn reset_timeout(&self) -> Duration {
    Duration::from_millis(self.reset_timeout_ms)
  }
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      max_failures: default_max_failures(),
      reset_timeout_ms: default_reset_timeout_ms(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
  /// Explicit database path (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

fn default_max_failures() -> u32 {
  3
}

fn default_reset_timeout_ms() -> u64 {
  60_000
}

fn default_timeout_ms() -> u64 {
  5_000
}

/// On-disk shape of the config file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
  #[serde(default)]
  pub remote: RemoteSection,
  #[serde(default)]
  pub breaker: BreakerConfig,
  #[serde(default)]
  pub local: LocalConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
  pub url: Option<String>,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

impl Default for RemoteSection {
  fn default() -> Self {
    Self {
      url: None,
      timeout_ms: default_timeout_ms(),
    }
  }
}

impl ConfigFile {
  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))
  }
}

impl Config {
  /// Load configuration from file and environment.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sfkv.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-kv/config.yaml
  ///
  /// A missing file is fine as long as SFKV_REMOTE_URL is set.
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

    let file = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => ConfigFile::default(),
    };

    Self::resolve(file, std::env::var("SFKV_REMOTE_URL").ok())
  }

  /// Merge the file with environment overrides and validate.
  pub fn resolve(file: ConfigFile, env_url: Option<String>) -> Result<Self> {
    let raw_url = env_url.or(file.remote.url).ok_or_else(|| {
      eyre!(
        "No remote store URL configured. Set SFKV_REMOTE_URL or remote.url in \
         ~/.config/storefront-kv/config.yaml"
      )
    })?;

    let url =
      Url::parse(&raw_url).map_err(|e| eyre!("Invalid remote URL '{}': {}", raw_url, e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
      return Err(eyre!("Remote URL must be http or https, got '{}'", raw_url));
    }

    if file.breaker.max_failures == 0 {
      return Err(eyre!("breaker.max_failures must be at least 1"));
    }

    Ok(Self {
      remote: RemoteConfig {
        url,
        timeout_ms: file.remote.timeout_ms,
      },
      breaker: file.breaker,
      local: file.local,
    })
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("sfkv.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    ConfigFile::parse(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  /// Get the remote store token from the environment, if any.
  ///
  /// Checks SFKV_REMOTE_TOKEN.
  pub fn get_remote_token() -> Option<String> {
    std::env::var("SFKV_REMOTE_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

/// Directory for the local database and log file.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join(APP_DIR))
}
