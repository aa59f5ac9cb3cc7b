//! # Command Line Interface
//!
//! Single executable: parse flags, configure logging, load the
//! configuration document, then run the agent loop until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::SnapshotAgent;
use crate::config::{load_config, watch_config, watcher::DEFAULT_POLL_INTERVAL, AgentConfig};
use crate::observability::logging;
use crate::{APP_NAME, VERSION};

#[derive(Debug, Parser)]
#[command(name = "vault-raft-snapshot-agent")]
#[command(about = "Takes periodic snapshots of vault's raft database")]
#[command(version = VERSION, disable_version_flag = true)]
pub struct Cli {
    /// Load configuration from FILE; if not specified, searches for
    /// snapshots.[yaml|yml|json|toml] in /etc/vault.d or the current
    /// working directory
    #[arg(short, long, value_name = "FILE", env = "VRSA_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Format for log output; one of 'default', 'text', 'json'
    #[arg(short = 'f', long, default_value = logging::FORMAT_DEFAULT, env = "VRSA_LOG_FORMAT")]
    pub log_format: String,

    /// Output target for logs; 'stderr', 'stdout' or a file path
    #[arg(short = 'o', long, default_value = logging::OUTPUT_STDERR, env = "VRSA_LOG_OUTPUT")]
    pub log_output: String,

    /// Log level; one of 'debug', 'info', 'warn', 'error'
    #[arg(short = 'l', long, default_value = "info", env = "VRSA_LOG_LEVEL")]
    pub log_level: String,

    /// Port for the prometheus metrics endpoint
    #[arg(short = 'p', long, value_name = "PORT", env = "VRSA_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Prints version information and exits
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: (),
}

/// Run the agent until it is shut down by a signal. A fatal error during
/// startup (invalid configuration, unknown auth method, unreachable
/// storage) is returned to the caller; after startup the agent only stops
/// on SIGINT/SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&cli.log_format, &cli.log_output, &cli.log_level)?;

    let (mut config, config_file) = load_config(cli.config.as_deref())?;
    apply_metrics_port(&mut config, cli.metrics_port);

    info!(
        app_name = APP_NAME,
        version = VERSION,
        config = %config_file.display(),
        "Starting snapshot agent"
    );

    let agent = Arc::new(SnapshotAgent::from_config(&config).await?);
    let shutdown = CancellationToken::new();

    tokio::spawn(handle_signals(shutdown.clone()));
    spawn_reload_task(agent.clone(), config_file, cli.metrics_port, shutdown.clone());

    agent.run(shutdown).await;
    agent.shutdown().await;

    info!("Snapshot agent stopped");
    Ok(())
}

/// Re-parse the configuration document whenever it changes on disk.
/// Invalid updates are logged and ignored; the previous configuration
/// stays in effect.
fn spawn_reload_task(
    agent: Arc<SnapshotAgent>,
    config_file: PathBuf,
    metrics_port: Option<u16>,
    shutdown: CancellationToken,
) {
    let mut changes = watch_config(config_file.clone(), DEFAULT_POLL_INTERVAL, shutdown);

    tokio::spawn(async move {
        while changes.recv().await.is_some() {
            match load_config(Some(&config_file)) {
                Ok((mut new_config, _)) => {
                    apply_metrics_port(&mut new_config, metrics_port);
                    match agent.reconfigure(&new_config).await {
                        Ok(()) => info!("Configuration reloaded"),
                        Err(err) => {
                            warn!(error = %err, "Could not reconfigure agent, keeping previous configuration");
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Ignoring invalid configuration update");
                }
            }
        }
    });
}

fn apply_metrics_port(config: &mut AgentConfig, metrics_port: Option<u16>) {
    if let Some(port) = metrics_port {
        config.metrics.prometheus.get_or_insert_with(Default::default).port = port;
    }
}

async fn handle_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received shutdown signal");
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Received shutdown signal");
    shutdown.cancel();
}
