use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidemark::remote::SqliteSourceConfig;
use tidemark::SyncSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub source: SourceConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub log: LogConfig,
}

/// How the source's timestamp column is stored
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimestampKind {
  /// Integer column (epoch seconds, millis or a revision counter)
  #[default]
  Integer,
  /// Text datetime column in any layout SQLite's `julianday` understands,
  /// compared to millisecond precision
  Datetime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
  /// SQLite database to mirror
  pub path: PathBuf,
  #[serde(default)]
  pub timestamp_kind: TimestampKind,
  #[serde(flatten)]
  pub table: SqliteSourceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Cache database (defaults to $XDG_DATA_HOME/tidemark/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_poll_interval", with = "humantime_serde")]
  pub poll_interval: Duration,
  #[serde(flatten)]
  pub settings: SyncSettings,
}

fn default_poll_interval() -> Duration {
  Duration::from_secs(30)
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval: default_poll_interval(),
      settings: SyncSettings::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// `EnvFilter` directives; `RUST_LOG` wins when set
  #[serde(default = "default_log_filter")]
  pub filter: String,
  /// Log to this file instead of stderr
  pub file: Option<PathBuf>,
}

fn default_log_filter() -> String {
  "info".to_string()
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: default_log_filter(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tidemark.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tidemark/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tidemark/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tidemark.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tidemark").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.sync.poll_interval.is_zero() {
      return Err(eyre!("sync.poll_interval must be greater than zero"));
    }
    if config.sync.settings.io_concurrency == 0 {
      return Err(eyre!("sync.io_concurrency must be greater than zero"));
    }
    Ok(config)
  }
}
