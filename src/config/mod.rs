//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{CliArgs, Command, GenerateArgs, ServeArgs, ServeOverrides, StoreOverrides};

use crate::{domain::types::ArtifactKey, store::pattern::keyspace_pattern};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "certcache";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_REAP_INTERVAL_MS: u64 = 1000;
const DEFAULT_GENERATION_TTL_SECS: u64 = 600;
const DEFAULT_GENERATION_PREFIX: &str = "foo";
const DEFAULT_STORE_WRITE_ATTEMPTS: u32 = 1;
const DEFAULT_WORKER_COUNT: u32 = 1;
const DEFAULT_WORKER_PAUSE_SECS: u64 = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 0;
const DEFAULT_HOST_KEY: &str = "example.com";
const DEFAULT_RESUBSCRIBE_DELAY_SECS: u64 = 5;
/// Upper bound for every duration setting (one year).
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub generation: GenerationSettings,
    pub workers: WorkerSettings,
    pub host: HostSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
pub struct StoreSettings {
    /// `None` selects the in-process store.
    pub url: Option<String>,
    pub configure_notifications: bool,
    pub reap_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub ttl: Duration,
    pub prefix: String,
    pub store_write_attempts: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: NonZeroU32,
    pub pause: Duration,
    /// Zero makes every submission wait until a worker takes the job.
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub dedupe_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Wait for space in the queue.
    Block,
    /// Fail the submission immediately.
    Reject,
}

impl QueueFullPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueFullPolicy::Block => "block",
            QueueFullPolicy::Reject => "reject",
        }
    }
}

impl FromStr for QueueFullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(QueueFullPolicy::Block),
            "reject" => Ok(QueueFullPolicy::Reject),
            other => Err(format!("unknown policy `{other}`, expected block or reject")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub key: ArtifactKey,
    pub notification_pattern: String,
    pub resubscribe_delay: Duration,
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

    builder = builder.add_source(Environment::with_prefix("CERTCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Generate(args)) => raw.apply_store_overrides(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    generation: RawGenerationSettings,
    workers: RawWorkerSettings,
    host: RawHostSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(ttl) = overrides.generation_ttl_seconds {
            self.generation.ttl_seconds = Some(ttl);
        }
        if let Some(prefix) = overrides.generation_prefix.as_ref() {
            self.generation.prefix = Some(prefix.clone());
        }
        if let Some(attempts) = overrides.generation_store_write_attempts {
            self.generation.store_write_attempts = Some(attempts);
        }
        if let Some(count) = overrides.workers_count {
            self.workers.count = Some(count);
        }
        if let Some(pause) = overrides.workers_pause_seconds {
            self.workers.pause_seconds = Some(pause);
        }
        if let Some(capacity) = overrides.workers_queue_capacity {
            self.workers.queue_capacity = Some(capacity);
        }
        if let Some(policy) = overrides.workers_queue_full_policy.as_ref() {
            self.workers.queue_full_policy = Some(policy.clone());
        }
        if let Some(dedupe) = overrides.workers_dedupe_in_flight {
            self.workers.dedupe_in_flight = Some(dedupe);
        }
        if let Some(key) = overrides.host_key.as_ref() {
            self.host.key = Some(key.clone());
        }
        if let Some(pattern) = overrides.host_notification_pattern.as_ref() {
            self.host.notification_pattern = Some(pattern.clone());
        }
        if let Some(delay) = overrides.host_resubscribe_delay_seconds {
            self.host.resubscribe_delay_seconds = Some(delay);
        }

        self.apply_store_overrides(&overrides.store);
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(url) = overrides.store_url.as_ref() {
            self.store.url = Some(url.clone());
        }
        if let Some(configure) = overrides.store_configure_notifications {
            self.store.configure_notifications = Some(configure);
        }
        if let Some(interval) = overrides.store_reap_interval_ms {
            self.store.reap_interval_ms = Some(interval);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            generation,
            workers,
            host,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let store = build_store_settings(store)?;
        let generation = build_generation_settings(generation)?;
        let workers = build_worker_settings(workers)?;
        let host = build_host_settings(host)?;

        Ok(Self {
            server,
            logging,
            store,
            generation,
            workers,
            host,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr =
        parse_socket_addr(&host, port).map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = positive_seconds(
        server
            .graceful_shutdown_seconds
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
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

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let url = store.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let reap_interval_ms = store.reap_interval_ms.unwrap_or(DEFAULT_REAP_INTERVAL_MS);
    if reap_interval_ms == 0 {
        return Err(LoadError::invalid(
            "store.reap_interval_ms",
            "must be greater than zero",
        ));
    }
    if reap_interval_ms / 1000 > MAX_DURATION_SECS {
        return Err(LoadError::invalid(
            "store.reap_interval_ms",
            format!("must not exceed {MAX_DURATION_SECS} seconds"),
        ));
    }

    Ok(StoreSettings {
        url,
        configure_notifications: store.configure_notifications.unwrap_or(false),
        reap_interval: Duration::from_millis(reap_interval_ms),
    })
}

fn build_generation_settings(
    generation: RawGenerationSettings,
) -> Result<GenerationSettings, LoadError> {
    let ttl = positive_seconds(
        generation
            .ttl_seconds
            .unwrap_or(DEFAULT_GENERATION_TTL_SECS),
        "generation.ttl_seconds",
    )?;

    let prefix = generation
        .prefix
        .unwrap_or_else(|| DEFAULT_GENERATION_PREFIX.to_string());

    let attempts = generation
        .store_write_attempts
        .unwrap_or(DEFAULT_STORE_WRITE_ATTEMPTS);

    Ok(GenerationSettings {
        ttl,
        prefix,
        store_write_attempts: non_zero_u32(attempts.into(), "generation.store_write_attempts")?,
    })
}

fn build_worker_settings(workers: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let count = workers.count.unwrap_or(DEFAULT_WORKER_COUNT);
    let pause = bounded_seconds(
        workers.pause_seconds.unwrap_or(DEFAULT_WORKER_PAUSE_SECS),
        "workers.pause_seconds",
    )?;
    let queue_capacity = workers.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);

    let queue_full_policy = match workers.queue_full_policy {
        Some(policy) => QueueFullPolicy::from_str(&policy)
            .map_err(|reason| LoadError::invalid("workers.queue_full_policy", reason))?,
        None => QueueFullPolicy::Block,
    };
    if queue_capacity == 0 && queue_full_policy == QueueFullPolicy::Reject {
        return Err(LoadError::invalid(
            "workers.queue_full_policy",
            "reject requires workers.queue_capacity greater than zero",
        ));
    }

    Ok(WorkerSettings {
        count: non_zero_u32(count.into(), "workers.count")?,
        pause,
        queue_capacity,
        queue_full_policy,
        dedupe_in_flight: workers.dedupe_in_flight.unwrap_or(false),
    })
}

fn build_host_settings(host: RawHostSettings) -> Result<HostSettings, LoadError> {
    let key = ArtifactKey::parse(host.key.unwrap_or_else(|| DEFAULT_HOST_KEY.to_string()))
        .map_err(|err| LoadError::invalid("host.key", err.to_string()))?;

    let notification_pattern = match host.notification_pattern {
        Some(pattern) if pattern.trim().is_empty() => {
            return Err(LoadError::invalid(
                "host.notification_pattern",
                "pattern must not be empty",
            ));
        }
        Some(pattern) => pattern,
        None => keyspace_pattern(key.as_str()),
    };

    let resubscribe_delay = positive_seconds(
        host.resubscribe_delay_seconds
            .unwrap_or(DEFAULT_RESUBSCRIBE_DELAY_SECS),
        "host.resubscribe_delay_seconds",
    )?;

    Ok(HostSettings {
        key,
        notification_pattern,
        resubscribe_delay,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
    configure_notifications: Option<bool>,
    reap_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGenerationSettings {
    ttl_seconds: Option<u64>,
    prefix: Option<String>,
    store_write_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    count: Option<u32>,
    pause_seconds: Option<u64>,
    queue_capacity: Option<usize>,
    queue_full_policy: Option<String>,
    dedupe_in_flight: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHostSettings {
    key: Option<String>,
    notification_pattern: Option<String>,
    resubscribe_delay_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn bounded_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value > MAX_DURATION_SECS {
        return Err(LoadError::invalid(
            key,
            format!("must not exceed {MAX_DURATION_SECS} seconds"),
        ));
    }
    Ok(Duration::from_secs(value))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    bounded_seconds(value, key)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
