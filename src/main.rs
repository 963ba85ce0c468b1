use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use condor_occupancy::agent::{Agent, SummaryRequest};
use condor_occupancy::config::Config;

/// Slot occupancy accounting for HTCondor pools.
#[derive(Parser)]
#[command(name = "condor-occupancy", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the config file's log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every configured pool until interrupted (default).
    Run,
    /// Aggregate slot epochs into time buckets once and export them.
    Summarize(SummarizeArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct SummarizeArgs {
    /// Window start, as a timedelta before now or an RFC 3339 timestamp.
    #[arg(long)]
    after: Option<String>,

    /// Window end, as a timedelta before now or an RFC 3339 timestamp.
    #[arg(long)]
    before: Option<String>,

    /// Bucket width, e.g. 20m or 1h.
    #[arg(long)]
    interval: Option<String>,

    /// Write buckets to stdout as NDJSON instead of the configured exporters.
    #[arg(long)]
    dry_run: bool,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, set at build time via env, or "unknown".
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

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

    if let Some(Command::Version) = &cli.command {
        println!("condor-occupancy {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    // Summary NDJSON goes to stdout, so logs go to stderr.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Summarize(args)) => rt.block_on(summarize(cfg, args)),
        _ => rt.block_on(run(cfg)),
    }
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting condor-occupancy",
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    shutdown.cancelled().await;

    agent.stop().await?;

    tracing::info!("condor-occupancy stopped");

    Ok(())
}

async fn summarize(cfg: Config, args: SummarizeArgs) -> Result<()> {
    let req = SummaryRequest {
        after: args.after.unwrap_or_else(|| cfg.summary.after.clone()),
        before: args.before.unwrap_or_else(|| cfg.summary.before.clone()),
        interval: args.interval.unwrap_or_else(|| cfg.summary.interval.clone()),
        dry_run: args.dry_run,
    };

    let agent = Agent::new(cfg)?;
    agent.summarize(&req).await?;

    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        shutdown.cancel();
    });

    Ok(())
}
