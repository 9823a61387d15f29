use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netstatsd::{agent, config};
use tracing_subscriber::{fmt, EnvFilter};

/// Network usage accounting daemon.
#[derive(Parser)]
#[command(name = "netstatsd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the configured level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info. GIT_COMMIT is read from the build environment.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("netstatsd {}", version::full());
        return Ok(());
    }

    // Without a config file the defaults apply.
    let cfg = match &cli.config {
        Some(path) => config::Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::Config::default(),
    };

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting netstatsd",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: config::Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler, waiting for SIGINT");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = agent::Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("netstatsd stopped");

    Ok(())
}
