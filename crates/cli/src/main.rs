mod config_commands;
mod listener_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    teleindex_config::TeleindexConfig,
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "teleindex", about = "teleindex: channel ingestion admin")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./teleindex.toml and the user
    /// config directory).
    #[arg(long, global = true, env = "TELEINDEX_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted listener status and monitored channels.
    Status {
        /// Print the raw JSON status.
        #[arg(long)]
        json: bool,
    },
    /// Ask the running listener to stop.
    Stop,
    /// Monitored channel management.
    Channels {
        #[command(subcommand)]
        action: listener_commands::ChannelAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Install the metrics recorder when the build and the config both allow it.
#[cfg(feature = "metrics")]
fn init_metrics(config: &TeleindexConfig) -> anyhow::Result<teleindex_metrics::MetricsHandle> {
    let handle = teleindex_metrics::init_metrics(teleindex_metrics::MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config
            .metrics
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })?;
    Ok(handle)
}

/// Explicit `--config` must load; discovery falls back to defaults.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<TeleindexConfig> {
    match path {
        Some(path) => {
            let mut config = teleindex_config::load_config(path)?;
            teleindex_config::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            Ok(config)
        },
        None => Ok(teleindex_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "teleindex starting");

    match cli.command {
        Commands::Config { action } => config_commands::handle_config(action, cli.config.as_deref()),
        command => {
            let config = load_config(cli.config.as_ref())?;
            #[cfg(feature = "metrics")]
            let _metrics = init_metrics(&config)?;
            info!(database = %config.database.url, "using status store");
            let state = listener_commands::open_state(&config).await?;
            match command {
                Commands::Status { json } => listener_commands::status(&state, json).await,
                Commands::Stop => listener_commands::stop(&state).await,
                Commands::Channels { action } => {
                    listener_commands::handle_channels(&state, action).await
                },
                Commands::Config { .. } => Ok(()),
            }
        },
    }
}
