use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::store::{Cache, MemoryStore, SqliteStore};
use crate::task::{Freshness, TaskOptions};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub store: StoreKind,
  /// Capacity of the event bus and change channels
  #[serde(default = "default_bus_capacity")]
  pub bus_capacity: usize,
  #[serde(default)]
  pub defaults: DefaultsConfig,
  #[serde(default)]
  pub log: LogConfig,
}

fn default_bus_capacity() -> usize {
  1024
}

impl Default for Config {
  fn default() -> Self {
    Self {
      store: StoreKind::default(),
      bus_capacity: default_bus_capacity(),
      defaults: DefaultsConfig::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
  #[default]
  Memory,
  /// In-memory SQLite, serialized on the blocking pool
  Sqlite,
}

/// Options applied to task descriptors that leave them unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
  pub freshness: Option<Freshness>,
  pub retry_after_ms: Option<i64>,
  pub timeout_ms: Option<u64>,
}

impl DefaultsConfig {
  /// Fill every unset option from these defaults.
  pub fn apply(&self, options: &mut TaskOptions) {
    if options.freshness.is_none() {
      options.freshness = self.freshness;
    }
    if options.retry_after.is_none() {
      options.retry_after = self.retry_after_ms.map(Duration::milliseconds);
    }
    if options.timeout.is_none() {
      options.timeout = self.timeout_ms.map(std::time::Duration::from_millis);
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Directory for the log file; no file logging when unset
  pub dir: Option<PathBuf>,
  #[serde(default = "default_log_file")]
  pub file: String,
}

fn default_log_file() -> String {
  "rescache.log".to_string()
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      dir: None,
      file: default_log_file(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
  ///
  /// Without any file the defaults apply.
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
    let local = PathBuf::from("rescache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rescache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Build an empty cache over the configured store.
  pub fn open_cache(&self) -> Result<Cache> {
    Ok(match self.store {
      StoreKind::Memory => Cache::with_capacity(MemoryStore::new(), self.bus_capacity),
      StoreKind::Sqlite => Cache::with_capacity(SqliteStore::open()?, self.bus_capacity),
    })
  }
}
