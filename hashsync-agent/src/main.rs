//! Hashsync Agent - Main entry point
//!
//! Runs the configured sync targets once, or keeps running them on an
//! interval in daemon mode.

use anyhow::{bail, Context, Result};
use clap::Parser;
use hashsync_agent::daemon::shutdown::ShutdownCoordinator;
use hashsync_agent::daemon::{run_cycle, run_daemon};
use hashsync_agent::store::LocalStore;
use hashsync_agent::transfer::progress::{format_bytes, format_speed};
use hashsync_agent::{config::Config, utils, Executor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run only the target with this id
    #[arg(short, long, value_name = "ID")]
    target: Option<String>,

    /// Keep running, syncing every `daemon.interval_secs`
    #[arg(short, long)]
    daemon: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting hashsync-agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );

    let targets = match &args.target {
        Some(id) => {
            let selected: Vec<_> = config.targets.iter().filter(|t| &t.id == id).cloned().collect();
            if selected.is_empty() {
                bail!("no target with id '{}' in {}", id, args.config.display());
            }
            selected
        }
        None => config.targets.clone(),
    };

    let shutdown = ShutdownCoordinator::new();
    let store = Arc::new(LocalStore::new(&config.store.root));
    let executor = Executor::with_cancel(
        store,
        &config.agent.state_dir,
        &config.agent.scratch_dir,
        shutdown.token(),
    );

    let signals = shutdown.clone();
    tokio::spawn(async move {
        signals.wait_for_signal().await;
    });

    if args.daemon {
        let interval = Duration::from_secs(config.daemon.interval_secs.max(1));
        run_daemon(&executor, &targets, interval, &shutdown).await;
        return Ok(());
    }

    let summary = run_cycle(&executor, &targets).await;
    for report in &summary.reports {
        tracing::info!(
            "{} ({}): {}, {} processed, {} transferred, {}",
            report.target_id,
            report.direction,
            report.outcome,
            format_bytes(report.progress.processed),
            format_bytes(report.progress.transferred),
            format_speed(report.progress.speed)
        );
    }

    if !summary.is_success() {
        for (id, err) in &summary.failures {
            tracing::error!("{}: {}", id, err);
        }
        bail!("{} of {} targets failed", summary.failures.len(), targets.len());
    }

    Ok(())
}
