//! Lodestone worker daemon.
//!
//! Runs the conversion pipeline: a pool of workers draining the job queue,
//! plus a periodic cleanup job that prunes aged job records and stale
//! scratch files. The HTTP frontend enqueues uploads into the same storage
//! root this daemon watches.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults against ./lsif-storage
//! lodestone-worker
//!
//! # Run against a config file with overrides
//! lodestone-worker --config /etc/lodestone.toml --workers 8
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lodestone_config::LodestoneConfig;
use lodestone_core::{
    spawn_cleanup_scheduler, spawn_pool, CommitGraph, HttpGitClient, JobQueue, StorageLayout,
    Worker, XrepoIndex,
};

/// Lodestone - conversion worker daemon
#[derive(Parser, Debug)]
#[command(name = "lodestone-worker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short = 'c', env = "LODESTONE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root, overriding the config file
    #[arg(long, env = "LODESTONE_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Number of conversion workers, overriding the config file
    #[arg(long, env = "LODESTONE_WORKERS")]
    workers: Option<usize>,

    /// Enable verbose output
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LodestoneConfig::from_file(path)?,
        None => LodestoneConfig::default(),
    };
    if let Some(root) = cli.storage_root {
        config.storage.root = root;
    }
    if let Some(workers) = cli.workers {
        config.worker.count = workers;
    }
    config.validate()?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(&config.logging.level)
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    run(config).await
}

async fn run(config: LodestoneConfig) -> Result<()> {
    let storage = StorageLayout::new(config.storage.root.clone());
    storage
        .bootstrap()
        .with_context(|| format!("cannot prepare storage root {}", storage.root().display()))?;

    let job_max_age = Duration::from_secs(config.worker.job_max_age_secs);
    match storage.sweep_stale_files(job_max_age) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "swept stale files from a previous run"),
        Err(err) => warn!(error = %err, "startup sweep failed"),
    }

    let xrepo = Arc::new(
        XrepoIndex::open(&storage.xrepo_db_path()).context("cannot open xrepo index")?,
    );
    let queue =
        Arc::new(JobQueue::open(&storage.jobs_db_path()).context("cannot open job queue")?);
    let git = Arc::new(HttpGitClient::new(config.gitserver.addresses.clone()));
    let commit_graph = Arc::new(CommitGraph::new(Arc::clone(&xrepo), git));

    let worker = Arc::new(Worker::new(
        storage,
        xrepo,
        commit_graph,
        Arc::clone(&queue),
        job_max_age,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = Duration::from_secs(config.worker.poll_interval_secs.max(1));
    let handles = spawn_pool(
        Arc::clone(&worker),
        config.worker.count,
        poll_interval,
        shutdown_rx.clone(),
    );
    let cleaner = spawn_cleanup_scheduler(
        queue,
        Duration::from_secs(config.worker.clean_interval_secs.max(1)),
        shutdown_rx,
    );

    info!(
        workers = config.worker.count,
        storage = %config.storage.root.display(),
        "worker daemon started"
    );

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!("shutdown requested, draining workers");
    shutdown_tx.send(true).ok();

    for handle in handles {
        handle.await.ok();
    }
    cleaner.await.ok();

    let (processed, failed, retried) = worker.metrics().snapshot();
    info!(processed, failed, retried, "worker daemon stopped");
    Ok(())
}
