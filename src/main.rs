use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use skytrail::agent::{PublisherAgent, RecorderAgent};
use skytrail::config::Config;
use skytrail::logging;

/// Real-time ADS-B telemetry pipeline.
#[derive(Parser)]
#[command(name = "skytrail", about)]
struct Cli {
    /// Logging verbosity override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest the dump1090 feed, assemble tracks, and publish
    /// snapshots over WebSocket.
    Publisher,
    /// Subscribe to the published stream and record path history into
    /// SQLite.
    Recorder,
    /// Print version information and exit.
    Version,
}

mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let component = match &cli.command {
        Command::Version => {
            println!("skytrail {}", version::full());
            return Ok(());
        }
        Command::Publisher => "publisher",
        Command::Recorder => "recorder",
    };

    // All runtime configuration comes from the environment; a bad
    // value is a fatal init failure (non-zero exit).
    let cfg = Config::from_env().context("reading configuration")?;

    logging::init(component, &cfg.log_dir, cli.log_level.as_deref())?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        component,
        "starting skytrail",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cli.command, cfg).await })
}

async fn run(command: Command, cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received SIGINT, shutting down");
        }

        let _ = shutdown_tx.send(());
    });

    match command {
        Command::Publisher => {
            let mut agent = PublisherAgent::new(cfg);
            agent.start().await?;
            wait_for_shutdown(shutdown_rx, agent.cancel_token()).await;
            agent.stop().await?;
        }
        Command::Recorder => {
            let mut agent = RecorderAgent::new(cfg);
            agent.start().await?;
            wait_for_shutdown(shutdown_rx, agent.cancel_token()).await;
            agent.stop().await?;
        }
        Command::Version => unreachable!("handled before runtime start"),
    }

    tracing::info!("skytrail stopped");
    Ok(())
}

/// Blocks until an external signal or an internal fault escalation.
async fn wait_for_shutdown(
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    cancel: tokio_util::sync::CancellationToken,
) {
    tokio::select! {
        _ = shutdown_rx => {}
        _ = cancel.cancelled() => {
            tracing::warn!("internal fault escalation, shutting down");
        }
    }
}
