use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod config;

#[derive(Parser)]
#[command(name = "relay", about = "IPTV live stream relay")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve playlists and channel streams
    Run(ConfigArgs),
    /// Check a configuration file and exit
    Validate(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Proxy(#[from] proxy::errors::ProxyError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Run(args) => run(&args.config),
        CliCommand::Validate(args) => Config::from_file(&args.config)
            .map(|config| {
                println!(
                    "{}: ok, {} channels",
                    args.config.display(),
                    config.proxy.channels.len()
                );
            })
            .map_err(RelayError::from),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(path: &Path) -> Result<(), RelayError> {
    let config = Config::from_file(path)?;

    let _sentry = init_logging(config.sentry_dsn());
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let (reload_tx, reload_rx) = mpsc::channel(1);
        tokio::spawn(watch_reloads(path.to_path_buf(), reload_tx));

        tracing::info!(
            channels = config.proxy.channels.len(),
            version = env!("CARGO_PKG_VERSION"),
            "relay starting"
        );

        tokio::select! {
            res = proxy::run(config.proxy, reload_rx) => res.map_err(RelayError::from),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                Ok(())
            }
        }
    })
}

/// Installs the log subscriber, forwarding to Sentry when a DSN is set.
/// The returned guard flushes pending Sentry events when dropped.
fn init_logging(sentry_dsn: Option<&str>) -> Option<sentry::ClientInitGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let guard = sentry_dsn.map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), RelayError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some("relay"))
        .map_err(|e| RelayError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| RelayError::Metrics(e.to_string()))?;

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "sending metrics to statsd"
    );
    Ok(())
}

/// Re-reads the configuration file on SIGHUP. A file that fails to load is
/// reported and the running configuration is kept.
async fn watch_reloads(path: PathBuf, reloads: mpsc::Sender<proxy::config::Config>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::error!(error = %e, "could not listen for SIGHUP, reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        tracing::info!(path = %path.display(), "SIGHUP received, reloading configuration");
        match Config::from_file(&path) {
            Ok(config) => {
                if reloads.send(config.proxy).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::error!(error = %e, "keeping the current configuration"),
        }
    }
}
