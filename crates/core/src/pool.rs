//! Bounded concurrent upload of many targets
//!
//! A semaphore caps the number of transfers in flight and a `JoinSet` owns
//! the spawned workers. Every target that enters the pool produces exactly
//! one entry in [`RunStatistics`], whether it ran, was rejected or was
//! skipped because the run was cancelled.

use crate::config::ConfigFile;
use crate::error::{Error, FailureKind, Result};
use crate::source::UploadTarget;
use crate::uploader::FileUploader;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pool sizing and file-level retry settings
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Transfers allowed in flight at once
    pub concurrency: usize,
    /// Whole-file attempts for transient failures
    pub file_attempts: u32,
    /// Wait before the second attempt; grows linearly after that
    pub retry_wait: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            file_attempts: 3,
            retry_wait: Duration::from_secs(2),
        }
    }
}

impl PoolOptions {
    pub fn from_config(config: &ConfigFile) -> Self {
        Self {
            concurrency: config.upload.max_concurrent_uploads.max(1),
            file_attempts: config.upload.file_attempts.max(1),
            ..Self::default()
        }
    }
}

/// Terminal result for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Uploaded { remote_path: String },
    /// The destination already exists
    Conflict { message: String },
    Failed { message: String, cancelled: bool },
}

/// What happened to one target
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub source: String,
    pub destination: String,
    pub bytes: u64,
    pub attempts: u32,
    pub outcome: TargetOutcome,
}

impl TargetReport {
    fn cancelled(target: &UploadTarget) -> Self {
        Self {
            source: target.identity().to_string(),
            destination: target.destination.clone(),
            bytes: target.len(),
            attempts: 0,
            outcome: TargetOutcome::Failed {
                message: Error::Cancelled.to_string(),
                cancelled: true,
            },
        }
    }

    fn from_result(target: &UploadTarget, attempts: u32, result: &Result<String>) -> Self {
        let outcome = match result {
            Ok(remote_path) => TargetOutcome::Uploaded {
                remote_path: remote_path.clone(),
            },
            Err(e) if e.is_conflict() => TargetOutcome::Conflict {
                message: e.to_string(),
            },
            Err(e) => TargetOutcome::Failed {
                message: e.to_string(),
                cancelled: matches!(e, Error::Cancelled),
            },
        };
        Self {
            source: target.identity().to_string(),
            destination: target.destination.clone(),
            bytes: target.len(),
            attempts,
            outcome,
        }
    }
}

/// Aggregate counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub success: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Source identities of failed targets, in completion order
    pub failed_items: Vec<String>,
    pub bytes_uploaded: u64,
}

impl RunStatistics {
    pub fn total(&self) -> usize {
        self.success + self.failed + self.conflicts
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn record(&mut self, report: &TargetReport) {
        match &report.outcome {
            TargetOutcome::Uploaded { .. } => {
                self.success += 1;
                self.bytes_uploaded += report.bytes;
            }
            TargetOutcome::Conflict { .. } => self.conflicts += 1,
            TargetOutcome::Failed { .. } => {
                self.failed += 1;
                self.failed_items.push(report.source.clone());
            }
        }
    }
}

/// Callback invoked once per finished target
pub type Observer = Arc<dyn Fn(&TargetReport) + Send + Sync>;

/// Runs uploads with a fixed concurrency limit
pub struct WorkerPool {
    uploader: Arc<dyn FileUploader>,
    options: PoolOptions,
    observer: Option<Observer>,
}

impl WorkerPool {
    pub fn new(uploader: Arc<dyn FileUploader>, options: PoolOptions) -> Self {
        Self {
            uploader,
            options,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Upload every target the stream yields and return the run's counters.
    ///
    /// After `cancel` fires no new transfer starts; remaining targets are
    /// recorded as cancelled failures. An authentication failure cancels
    /// the run.
    pub async fn run<S>(&self, targets: S, cancel: CancellationToken) -> RunStatistics
    where
        S: Stream<Item = UploadTarget>,
    {
        let stats = Arc::new(Mutex::new(RunStatistics::default()));
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut targets = std::pin::pin!(targets);

        info!(concurrency = self.options.concurrency, "Starting upload run");

        while let Some(target) = targets.next().await {
            if cancel.is_cancelled() {
                finish(&stats, self.observer.as_ref(), TargetReport::cancelled(&target));
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            // a worker may have cancelled the run just before releasing its slot
            let Some(permit) = permit.filter(|_| !cancel.is_cancelled()) else {
                finish(&stats, self.observer.as_ref(), TargetReport::cancelled(&target));
                continue;
            };

            let uploader = self.uploader.clone();
            let options = self.options.clone();
            let task_stats = stats.clone();
            let observer = self.observer.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let (attempts, result) =
                    upload_with_retry(uploader.as_ref(), &target, &options, &cancel).await;

                if let Err(Error::Authentication(message)) = &result {
                    error!(error = %message, "Authentication failed, cancelling run");
                    cancel.cancel();
                }

                let report = TargetReport::from_result(&target, attempts, &result);
                finish(&task_stats, observer.as_ref(), report);
            });

            while let Some(joined) = join_set.try_join_next() {
                record_panic(&stats, joined);
            }
        }

        while let Some(joined) = join_set.join_next().await {
            record_panic(&stats, joined);
        }

        let stats = lock(&stats).clone();
        info!(
            success = stats.success,
            failed = stats.failed,
            conflicts = stats.conflicts,
            bytes = stats.bytes_uploaded,
            "Upload run finished"
        );
        stats
    }
}

/// Upload one target, retrying the whole file on transient failures
async fn upload_with_retry(
    uploader: &dyn FileUploader,
    target: &UploadTarget,
    options: &PoolOptions,
    cancel: &CancellationToken,
) -> (u32, Result<String>) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = uploader.upload(target, cancel).await;

        let transient = matches!(&result, Err(e) if e.kind() == FailureKind::Transient);
        if !transient || attempt >= options.file_attempts || cancel.is_cancelled() {
            return (attempt, result);
        }

        let wait = options.retry_wait.saturating_mul(attempt);
        if let Err(e) = &result {
            warn!(
                source = target.identity(),
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %e,
                "Retrying file"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return (attempt, Err(Error::Cancelled)),
        }
    }
}

fn lock(stats: &Mutex<RunStatistics>) -> std::sync::MutexGuard<'_, RunStatistics> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn finish(stats: &Mutex<RunStatistics>, observer: Option<&Observer>, report: TargetReport) {
    match &report.outcome {
        TargetOutcome::Uploaded { remote_path } => {
            info!(source = %report.source, remote = %remote_path, "Uploaded")
        }
        TargetOutcome::Conflict { message } => {
            info!(source = %report.source, reason = %message, "Already exists")
        }
        TargetOutcome::Failed { message, .. } => {
            warn!(source = %report.source, error = %message, "Upload failed")
        }
    }

    lock(stats).record(&report);
    if let Some(observer) = observer {
        observer(&report);
    }
}

fn record_panic(stats: &Mutex<RunStatistics>, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Upload worker panicked");
        let mut stats = lock(stats);
        stats.failed += 1;
        stats.failed_items.push(format!("<worker: {}>", e));
    }
}
