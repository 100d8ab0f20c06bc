//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "scorta";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CACHE_REBUILD_WORKERS: usize = 4;
const DEFAULT_CACHE_REBUILD_QUEUE: usize = 64;
const DEFAULT_CACHE_MUTEX_LOCK_TTL_SECS: u64 = 10;
const DEFAULT_CACHE_MUTEX_MAX_WAIT_SECS: u64 = 2;
const DEFAULT_CACHE_REBUILD_LOCK_TTL_SECS: u64 = 10;
const DEFAULT_PERSISTER_STREAM: &str = "stream.orders";
const DEFAULT_PERSISTER_GROUP: &str = "g1";
const DEFAULT_PERSISTER_CONSUMER: &str = "c1";
const DEFAULT_PERSISTER_BLOCK_SECS: u64 = 2;
const DEFAULT_PERSISTER_LOCK_TTL_SECS: u64 = 10;

/// Command-line arguments for the Scorta binary.
#[derive(Debug, Parser)]
#[command(name = "scorta", version, about = "Scorta order-admission service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SCORTA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the admission service and the order persister.
    Serve(ServeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long = "log-json", action = clap::ArgAction::SetTrue)]
    pub log_json: bool,

    /// Override the cache rebuild worker count.
    #[arg(long = "cache-rebuild-workers", value_name = "COUNT")]
    pub cache_rebuild_workers: Option<usize>,

    /// Override the cache rebuild queue capacity.
    #[arg(long = "cache-rebuild-queue", value_name = "COUNT")]
    pub cache_rebuild_queue: Option<usize>,

    /// Override the persister consumer name.
    #[arg(long = "persister-consumer", value_name = "NAME")]
    pub persister_consumer: Option<String>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub redis: RedisSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub persister: PersisterSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub rebuild_workers: usize,
    pub rebuild_queue: usize,
    pub mutex_lock_ttl: Duration,
    pub mutex_max_wait: Duration,
    pub rebuild_lock_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct PersisterSettings {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub block: Duration,
    pub lock_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SCORTA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    redis: RawRedisSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    persister: RawPersisterSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if overrides.log_json {
            self.logging.json = Some(true);
        }
        if let Some(workers) = overrides.cache_rebuild_workers {
            self.cache.rebuild_workers = Some(workers);
        }
        if let Some(queue) = overrides.cache_rebuild_queue {
            self.cache.rebuild_queue = Some(queue);
        }
        if let Some(consumer) = overrides.persister_consumer.as_ref() {
            self.persister.consumer = Some(consumer.clone());
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    rebuild_workers: Option<usize>,
    rebuild_queue: Option<usize>,
    mutex_lock_ttl_seconds: Option<u64>,
    mutex_max_wait_seconds: Option<u64>,
    rebuild_lock_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPersisterSettings {
    stream: Option<String>,
    group: Option<String>,
    consumer: Option<String>,
    block_seconds: Option<u64>,
    lock_ttl_seconds: Option<u64>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            redis: build_redis_settings(raw.redis),
            database: build_database_settings(raw.database)?,
            cache: build_cache_settings(raw.cache)?,
            persister: build_persister_settings(raw.persister)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_redis_settings(redis: RawRedisSettings) -> RedisSettings {
    let url = redis
        .url
        .and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    RedisSettings { url }
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = database.max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    if max_connections == 0 {
        return Err(LoadError::invalid(
            "database.max_connections",
            "must be greater than zero",
        ));
    }

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let rebuild_workers = cache
        .rebuild_workers
        .unwrap_or(DEFAULT_CACHE_REBUILD_WORKERS);
    if rebuild_workers == 0 {
        return Err(LoadError::invalid(
            "cache.rebuild_workers",
            "must be greater than zero",
        ));
    }
    let rebuild_queue = cache.rebuild_queue.unwrap_or(DEFAULT_CACHE_REBUILD_QUEUE);
    if rebuild_queue == 0 {
        return Err(LoadError::invalid(
            "cache.rebuild_queue",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        rebuild_workers,
        rebuild_queue,
        mutex_lock_ttl: Duration::from_secs(
            cache
                .mutex_lock_ttl_seconds
                .unwrap_or(DEFAULT_CACHE_MUTEX_LOCK_TTL_SECS),
        ),
        mutex_max_wait: Duration::from_secs(
            cache
                .mutex_max_wait_seconds
                .unwrap_or(DEFAULT_CACHE_MUTEX_MAX_WAIT_SECS),
        ),
        rebuild_lock_ttl: Duration::from_secs(
            cache
                .rebuild_lock_ttl_seconds
                .unwrap_or(DEFAULT_CACHE_REBUILD_LOCK_TTL_SECS),
        ),
    })
}

fn build_persister_settings(
    persister: RawPersisterSettings,
) -> Result<PersisterSettings, LoadError> {
    let stream = persister
        .stream
        .unwrap_or_else(|| DEFAULT_PERSISTER_STREAM.to_string());
    let group = persister
        .group
        .unwrap_or_else(|| DEFAULT_PERSISTER_GROUP.to_string());
    let consumer = persister
        .consumer
        .unwrap_or_else(|| DEFAULT_PERSISTER_CONSUMER.to_string());
    for (key, value) in [
        ("persister.stream", &stream),
        ("persister.group", &group),
        ("persister.consumer", &consumer),
    ] {
        if value.trim().is_empty() {
            return Err(LoadError::invalid(key, "must not be empty"));
        }
    }

    Ok(PersisterSettings {
        stream,
        group,
        consumer,
        block: Duration::from_secs(persister.block_seconds.unwrap_or(DEFAULT_PERSISTER_BLOCK_SECS)),
        lock_ttl: Duration::from_secs(
            persister
                .lock_ttl_seconds
                .unwrap_or(DEFAULT_PERSISTER_LOCK_TTL_SECS),
        ),
    })
}
