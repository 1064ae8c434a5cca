use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the certcache binary.
#[derive(Debug, Parser)]
#[command(name = "certcache", version, about = "On-demand certificate cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CERTCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the certificate cache HTTP service and generation workers.
    Serve(Box<ServeArgs>),
    /// Generate and store certificates for the given keys, then exit.
    Generate(GenerateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Keys (domain names) to generate.
    #[arg(value_name = "KEY", required = true, num_args = 1..)]
    pub keys: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the artifact store URL (`redis://...`); unset uses the in-process store.
    #[arg(long = "store-url", value_name = "URL")]
    pub store_url: Option<String>,

    /// Enable keyspace expiration notifications on the store at connect time.
    #[arg(
        long = "store-configure-notifications",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub store_configure_notifications: Option<bool>,

    /// Override how often the in-process store sweeps expired entries.
    #[arg(long = "store-reap-interval-ms", value_name = "MILLISECONDS")]
    pub store_reap_interval_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the TTL applied to generated artifacts.
    #[arg(long = "generation-ttl-seconds", value_name = "SECONDS")]
    pub generation_ttl_seconds: Option<u64>,

    /// Override the prefix the generator puts in front of each key.
    #[arg(long = "generation-prefix", value_name = "PREFIX")]
    pub generation_prefix: Option<String>,

    /// Override the number of store write attempts per generated artifact.
    #[arg(long = "generation-store-write-attempts", value_name = "COUNT")]
    pub generation_store_write_attempts: Option<u32>,

    /// Override the number of generation workers.
    #[arg(long = "workers-count", value_name = "COUNT")]
    pub workers_count: Option<u32>,

    /// Override the pause each worker takes after a job.
    #[arg(long = "workers-pause-seconds", value_name = "SECONDS")]
    pub workers_pause_seconds: Option<u64>,

    /// Override the job queue capacity (0 waits for a worker to take each job).
    #[arg(long = "workers-queue-capacity", value_name = "COUNT")]
    pub workers_queue_capacity: Option<usize>,

    /// Override what happens when the job queue is full (block|reject).
    #[arg(long = "workers-queue-full-policy", value_name = "POLICY")]
    pub workers_queue_full_policy: Option<String>,

    /// Skip enqueueing keys that already have a queued or running job.
    #[arg(
        long = "workers-dedupe-in-flight",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub workers_dedupe_in_flight: Option<bool>,

    /// Override the host key kept warm by the expiration watcher.
    #[arg(long = "host-key", value_name = "KEY")]
    pub host_key: Option<String>,

    /// Override the keyspace notification pattern watched for the host key.
    #[arg(long = "host-notification-pattern", value_name = "PATTERN")]
    pub host_notification_pattern: Option<String>,

    /// Override the delay before the watcher resubscribes after its stream ends.
    #[arg(long = "host-resubscribe-delay-seconds", value_name = "SECONDS")]
    pub host_resubscribe_delay_seconds: Option<u64>,
}
