//! Conversion pipeline workers.
//!
//! A fixed-size pool of tasks pulls jobs from the shared queue. A convert
//! job parses the uploaded index into a scratch database, registers the
//! dump and its package facts transactionally, renames the file into its
//! final location, refreshes the commit graph, and deletes the raw upload.
//! Failure at any step removes the scratch file before the error reaches
//! the queue's retry policy, so no partial artifact survives a bad run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::commits::CommitGraph;
use crate::convert::{convert_lsif, ConversionOutput};
use crate::queue::{Job, JobKind, JobQueue, QueueError};
use crate::storage::StorageLayout;
use crate::xrepo::XrepoIndex;

/// Counters tracked across all workers.
#[derive(Debug, Default)]
pub struct JobMetrics {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
}

impl JobMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.retried.load(Ordering::Relaxed),
        )
    }
}

/// One conversion worker; the same instance is shared by every task in the
/// pool.
pub struct Worker {
    storage: StorageLayout,
    xrepo: Arc<XrepoIndex>,
    commit_graph: Arc<CommitGraph>,
    queue: Arc<JobQueue>,
    metrics: Arc<JobMetrics>,
    /// Jobs and stale files older than this are removed by the cleanup job.
    job_max_age: Duration,
}

impl Worker {
    pub fn new(
        storage: StorageLayout,
        xrepo: Arc<XrepoIndex>,
        commit_graph: Arc<CommitGraph>,
        queue: Arc<JobQueue>,
        job_max_age: Duration,
    ) -> Self {
        Self {
            storage,
            xrepo,
            commit_graph,
            queue,
            metrics: Arc::new(JobMetrics::default()),
            job_max_age,
        }
    }

    pub fn metrics(&self) -> Arc<JobMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Poll the queue until shutdown is signalled.
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "queue poll failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    /// Claim and process one job. Returns false when the queue was empty.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        let Some(job) = self.queue.dequeue()? else {
            return Ok(false);
        };

        let span = info_span!(
            "job",
            job_id = job.id,
            attempt = job.attempts,
            repository = job.tracing.get("repository").map(String::as_str).unwrap_or(""),
        );
        self.process_job(&job).instrument(span).await?;
        Ok(true)
    }

    async fn process_job(&self, job: &Job) -> Result<(), QueueError> {
        let started = std::time::Instant::now();
        let result = match &job.kind {
            JobKind::Convert { repository, commit, root, filename } => {
                self.convert_job(repository, commit, root, filename).await
            }
            JobKind::CleanOldJobs => self.clean_job(),
        };

        match result {
            Ok(()) => {
                self.queue.mark_complete(job.id)?;
                self.metrics.processed.fetch_add(1, Ordering::Relaxed);
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "job completed");
            }
            Err(err) => {
                let retrying = self.queue.mark_failed(job.id, &format!("{err:#}"))?;
                if retrying {
                    self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "job failed, will retry");
                } else {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %err, "job failed permanently");
                }
            }
        }
        Ok(())
    }

    /// Convert one upload into a completed dump.
    async fn convert_job(
        &self,
        repository: &str,
        commit: &str,
        root: &str,
        filename: &Path,
    ) -> anyhow::Result<()> {
        let tmp = self.storage.fresh_tmp_path();
        let result = self
            .convert_steps(repository, commit, root, filename, &tmp)
            .await;
        if result.is_err() {
            // The scratch file must never outlive a failed run. On success
            // the rename has already moved it away.
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    async fn convert_steps(
        &self,
        repository: &str,
        commit: &str,
        root: &str,
        filename: &Path,
        tmp: &Path,
    ) -> anyhow::Result<()> {
        let output = run_conversion(filename.to_path_buf(), tmp.to_path_buf()).await?;
        debug!(
            documents = output.document_count,
            packages = output.packages.len(),
            references = output.references.len(),
            "parsed upload"
        );

        let (dump_id, replaced) = self.xrepo.add_packages_and_references(
            repository,
            commit,
            root,
            &output.packages,
            &output.references,
        )?;

        let final_path = self.storage.dump_path(dump_id, repository, commit);
        if let Err(err) = tokio::fs::rename(tmp, &final_path).await {
            self.xrepo.mark_failed(dump_id)?;
            return Err(err.into());
        }
        self.xrepo.mark_complete(dump_id)?;

        // The new dump can change nearest-commit answers for this
        // repository even when no new edges were discovered.
        self.commit_graph.invalidate_repository(repository);
        self.commit_graph
            .discover_and_update_commit(repository, commit)
            .await?;

        if let Some(previous) = replaced {
            let old_path = self
                .storage
                .dump_path(previous.id, &previous.repository, &previous.commit);
            if let Err(err) = tokio::fs::remove_file(&old_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %old_path.display(), error = %err, "failed to remove replaced dump");
                }
            }
        }

        if let Err(err) = tokio::fs::remove_file(filename).await {
            warn!(path = %filename.display(), error = %err, "failed to remove upload");
        }

        info!(dump_id, repository, commit, root, "dump converted");
        Ok(())
    }

    fn clean_job(&self) -> anyhow::Result<()> {
        let removed_jobs = self.queue.clean_old_jobs(self.job_max_age.as_secs() as i64)?;
        let removed_files = self.storage.sweep_stale_files(self.job_max_age)?;
        debug!(removed_jobs, removed_files, "cleanup finished");
        Ok(())
    }
}

/// Parse the upload off the async runtime; conversion is blocking CPU and
/// file work.
async fn run_conversion(filename: PathBuf, tmp: PathBuf) -> anyhow::Result<ConversionOutput> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<ConversionOutput> {
        let file = std::fs::File::open(&filename)?;
        Ok(convert_lsif(file, &tmp)?)
    })
    .await?
}

/// Spawn `count` worker tasks sharing one [`Worker`].
pub fn spawn_pool(
    worker: Arc<Worker>,
    count: usize,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            tokio::spawn(
                async move { worker.run(poll_interval, shutdown).await }
                    .instrument(info_span!("worker", index)),
            )
        })
        .collect()
}

/// Periodically enqueue a cleanup job until shutdown.
pub fn spawn_cleanup_scheduler(
    queue: Arc<JobQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = queue.enqueue(&JobKind::CleanOldJobs, &Default::default(), 1) {
                        warn!(error = %err, "failed to enqueue cleanup job");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}
