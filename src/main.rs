mod config;

use chrono::{DateTime, Utc};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tidemark::remote::SqlTimestamp;
use tidemark::sync::TracingObserver;
use tidemark::{CacheStore, Projector, Record, RemoteSource, SqliteSource, SqliteStore, SyncEngine};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use config::{Config, LogConfig, TimestampKind};

#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(about = "Incrementally mirror a SQLite table into a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tidemark/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Run a single pass, cached items included, then exit
  #[arg(long)]
  once: bool,

  /// Override sync.poll_interval (e.g. "10s", "2m")
  #[arg(short, long, value_parser = humantime::parse_duration)]
  interval: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(interval) = args.interval {
    config.sync.poll_interval = interval;
  }

  // Stdout carries records; keep the guard alive so file logs are flushed
  let _guard = init_tracing(&config.log)?;

  match config.source.timestamp_kind {
    TimestampKind::Integer => run_mirror::<i64>(&config, args.once).await,
    TimestampKind::Datetime => run_mirror::<DateTime<Utc>>(&config, args.once).await,
  }
}

fn init_tracing(log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log.filter))?;

  let Some(path) = &log.file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or(Path::new("."));
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(Some(guard))
}

/// Mirror the configured table, printing each record as a JSON line.
async fn run_mirror<Ts>(config: &Config, once: bool) -> Result<()>
where
  Ts: SqlTimestamp + Serialize + DeserializeOwned,
{
  let source = SqliteSource::<Ts>::open(&config.source.path, config.source.table.clone())?;
  let namespace = source.cache_namespace();
  let store = match &config.cache.path {
    Some(path) => SqliteStore::open(path, namespace)?,
    None => SqliteStore::open_default(namespace)?,
  };

  let description = source.description().to_string();
  info!(source = %description, namespace = store.namespace(), "Opened cache");
  let projector = Projector::new(
    source.timestamp_column(),
    |record: &Record<Ts>| record.key.clone(),
    |record: &Record<Ts>| record.updated.clone(),
  );

  let cache: Arc<dyn CacheStore<Record<Ts>>> = Arc::new(store);
  let remote: Arc<dyn RemoteSource<Record<Ts>, Ts>> = Arc::new(source);
  let engine = SyncEngine::new(cache, remote, projector)
    .with_observer(Arc::new(TracingObserver::new(description.clone())))
    .with_settings(config.sync.settings.clone());

  let mut records = if once {
    info!(source = %description, "Mirroring once");
    engine.reconcile_with_cache()
  } else {
    let poller = engine.poller(config.sync.poll_interval)?;
    info!(source = %description, interval = ?poller.interval(), "Mirroring");
    poller.into_stream()
  };

  let mut emitted = 0usize;
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("Interrupted");
        break;
      }
      next = records.try_next() => {
        let Some(record) = next? else {
          break;
        };
        let mut out = std::io::stdout().lock();
        serde_json::to_writer(&mut out, &record)?;
        writeln!(out)?;
        emitted += 1;
      }
    }
  }

  info!(emitted, "Mirror stopped");
  Ok(())
}
