//! Worker loops that pull envelopes off the [`crate::queue`] and drive them
//! through [`crate::executor`], [`crate::exporter`], and [`crate::ingest`],
//! applying a queue-wide retry/backoff/dead-letter policy together with the
//! per-backend admission gate the scan tier needs specifically.
//!
//! Shaped like [`crate::reconciler::run`]'s `loop { ... }` worker shape,
//! generalized from "sweep on a timer" to "drain a queue forever"; the
//! backoff computation itself reuses
//! `tokio_retry::strategy::{ExponentialBackoff, jitter}` for the same
//! "retry a fallible operation with capped exponential backoff" shape this
//! module needs for queue redelivery instead.

use std::{sync::Arc, time::Duration as StdDuration};

use error_stack::{Result, ResultExt};
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{info, warn};

use crate::{
    admission,
    config::{FailurePolicy, RetryPolicy},
    db::Database,
    executor::{self, Deps},
    exporter::{self, BackendLookup, ExportJob},
    ingest::{self, IngestJob},
    model::{CommitTask, DeadLetterReason},
    queue::{Envelope, Priority, Receiver, Sender},
};

/// How long an admission-denied task waits before its job is retried
/// against the backend list again.
const ADMISSION_RETRY_DELAY: StdDuration = StdDuration::from_secs(60);

/// Ceiling on redelivery backoff, regardless of the configured policy.
const MAX_BACKOFF: StdDuration = StdDuration::from_secs(180);

/// Compute the delay before the `attempt`'th redelivery (0-indexed),
/// exponential from the policy's `base_delay`, jittered, and capped at
/// both the policy's own `max_delay` and the queue-wide [`MAX_BACKOFF`].
fn backoff_delay(policy: &RetryPolicy, attempt: usize) -> StdDuration {
    let cap = policy.max_delay().min(MAX_BACKOFF);
    let base_ms = policy.base_delay().as_millis().max(1) as u64;
    ExponentialBackoff::from_millis(base_ms)
        .map(jitter)
        .map(|d| d.min(cap))
        .nth(attempt)
        .unwrap_or(cap)
}

/// Drain the scan queue forever, executing each [`CommitTask`] against
/// whichever configured backend instance has a free admission slot.
///
/// `deps_by_backend` holds one [`Deps`] per configured backend instance,
/// tried in configuration order: if none admits the task, the job is
/// re-queued with a delay and its status reverts to queued.
pub async fn run_scan_worker<D: Database>(
    db: Arc<D>,
    mut receiver: Receiver<CommitTask>,
    scan_sender: Arc<Mutex<Sender<CommitTask>>>,
    export_sender: Arc<Mutex<Sender<ExportJob>>>,
    deps_by_backend: Arc<Vec<Deps<D>>>,
    retry: RetryPolicy,
) {
    loop {
        let guard = match receiver.recv().await {
            Ok(guard) => guard,
            Err(report) => {
                warn!(error = ?report, "failed to receive from scan queue");
                continue;
            }
        };
        let envelope = match guard.envelope() {
            Ok(envelope) => envelope,
            Err(report) => {
                warn!(error = ?report, "failed to decode scan queue envelope, dropping");
                let _ = guard.commit();
                continue;
            }
        };

        match process_scan_task(&db, &scan_sender, &export_sender, deps_by_backend.as_slice(), &retry, envelope).await {
            Ok(()) => {
                if let Err(report) = guard.commit() {
                    warn!(error = ?report, "failed to ack scan queue envelope");
                }
            }
            Err(report) => {
                warn!(error = ?report, "scan task processing failed");
                if let Err(report) = guard.commit() {
                    warn!(error = ?report, "failed to ack scan queue envelope after handling failure");
                }
            }
        }
    }
}

/// Errors encountered driving one scan-queue envelope to a terminal
/// outcome (committed, redelivered, or dead-lettered).
#[derive(Debug, thiserror::Error)]
enum ScanWorkerError {
    #[error("query or update repository store")]
    Persist,
    #[error("re-enqueue commit task")]
    Enqueue,
}

async fn process_scan_task<D: Database>(
    db: &D,
    scan_sender: &Mutex<Sender<CommitTask>>,
    export_sender: &Mutex<Sender<ExportJob>>,
    deps_by_backend: &[Deps<D>],
    retry: &RetryPolicy,
    envelope: Envelope<CommitTask>,
) -> Result<(), ScanWorkerError> {
    let task = envelope.payload.clone();
    db.claim_commit_task(task.project_key(), task.commit_sha())
        .await
        .change_context(ScanWorkerError::Persist)?;

    let Some((deps, guard)) = acquire_backend(db, deps_by_backend, &task).await? else {
        return requeue_for_admission(db, scan_sender, task).await;
    };
    // The slot is keyed on `(backend_instance, job_id)`, not on this one
    // task: it's meant to stay held across every commit in the job and is
    // released once by `executor::finalize_job_if_complete` when the job's
    // last commit lands, not here after each individual task.
    std::mem::forget(guard);

    db.set_job_progress_markers(*task.job_id(), Some(task.commit_sha()), Some(deps.backend_instance.name()))
        .await
        .change_context(ScanWorkerError::Persist)?;

    let result = executor::execute(deps, export_sender, task.clone()).await;

    match result {
        Ok(()) => Ok(()),
        Err(report) if report.current_context().is_permanent() => {
            // `executor::execute` already records every permanent failure
            // it can attribute to a specific component key; `Validation`
            // is the one case it can't (there's no reliable component_key
            // for a malformed task), so this worker dead-letters it directly.
            if matches!(report.current_context(), executor::Error::Validation) {
                dead_letter_and_fail(db, task, DeadLetterReason::Validation, "commit task payload is malformed", deps.failure_policy, deps.backend_instance.name()).await?;
            }
            Ok(())
        }
        Err(report) => {
            let attempt = envelope.retry_count as usize;
            if attempt + 1 >= retry.max_attempts() as usize {
                let message = format!("{report:#}");
                dead_letter_and_fail(db, task, DeadLetterReason::ScanFailed, &message, deps.failure_policy, deps.backend_instance.name()).await?;
                Ok(())
            } else {
                let delay = backoff_delay(retry, attempt);
                let redelivered = Envelope::redeliver(task, envelope.retry_count, delay);
                scan_sender
                    .lock()
                    .await
                    .send_envelope(redelivered, Priority::Normal)
                    .await
                    .change_context(ScanWorkerError::Enqueue)?;
                Ok(())
            }
        }
    }
}

/// Try each configured backend in order, returning the first that admits
/// this job along with its [`Deps`] and the acquired guard.
async fn acquire_backend<'a, D: Database>(
    db: &D,
    deps_by_backend: &'a [Deps<D>],
    task: &CommitTask,
) -> Result<Option<(&'a Deps<D>, admission::AdmissionGuard)>, ScanWorkerError> {
    for deps in deps_by_backend {
        let acquired = admission::try_acquire(
            db,
            deps.backend_instance.name(),
            deps.backend_instance.max_concurrent(),
            *task.job_id(),
            *task.data_source_id(),
        )
        .await
        .change_context(ScanWorkerError::Persist)?;
        if let Some(guard) = acquired {
            return Ok(Some((deps, guard)));
        }
    }
    Ok(None)
}

/// No backend admitted this task: revert the job to `queued` and redeliver
/// the task after [`ADMISSION_RETRY_DELAY`].
async fn requeue_for_admission<D: Database>(
    db: &D,
    scan_sender: &Mutex<Sender<CommitTask>>,
    task: CommitTask,
) -> Result<(), ScanWorkerError> {
    db.set_job_status(*task.job_id(), crate::model::JobStatus::Queued)
        .await
        .change_context(ScanWorkerError::Persist)?;

    let envelope = Envelope::delayed(task, ADMISSION_RETRY_DELAY);
    scan_sender
        .lock()
        .await
        .send_envelope(envelope, Priority::Normal)
        .await
        .change_context(ScanWorkerError::Enqueue)
}

/// Dead-letter a commit task and record its failure against the owning job,
/// recomputing the job's terminal status on this write path the same way
/// [`executor::execute`] does on its own.
async fn dead_letter_and_fail<D: Database>(
    db: &D,
    task: CommitTask,
    reason: DeadLetterReason,
    message: &str,
    failure_policy: FailurePolicy,
    backend_instance: &str,
) -> Result<(), ScanWorkerError> {
    let job_id = *task.job_id();
    let config_override = task.config_override().clone();
    db.insert_dead_letter(task, reason, config_override)
        .await
        .change_context(ScanWorkerError::Persist)?;

    let job = db.increment_job_failed(job_id, message).await.change_context(ScanWorkerError::Persist)?;
    executor::finalize_job_if_complete(db, job, failure_policy, backend_instance)
        .await
        .change_context(ScanWorkerError::Persist)
}

/// Drain the export queue forever, retrying transient failures with
/// backoff and dead-lettering exhausted ones according to the configured
/// export retry policy.
pub async fn run_export_worker<D: Database>(
    db: Arc<D>,
    mut receiver: Receiver<ExportJob>,
    export_sender: Arc<Mutex<Sender<ExportJob>>>,
    backend_for: BackendLookup<'static>,
    metrics: Arc<crate::config::MetricsConfig>,
    export_root: Arc<std::path::PathBuf>,
    retry: RetryPolicy,
) {
    loop {
        let guard = match receiver.recv().await {
            Ok(guard) => guard,
            Err(report) => {
                warn!(error = ?report, "failed to receive from export queue");
                continue;
            }
        };
        let envelope = match guard.envelope() {
            Ok(envelope) => envelope,
            Err(report) => {
                warn!(error = ?report, "failed to decode export queue envelope, dropping");
                let _ = guard.commit();
                continue;
            }
        };

        let result = exporter::export(db.as_ref(), backend_for, &metrics, &export_root, &envelope.payload).await;
        match result {
            Ok(()) => info!(component_key = %envelope.payload.component_key, "exported metrics"),
            Err(report) if report.current_context().is_retryable() => {
                let attempt = envelope.retry_count as usize;
                if attempt + 1 >= retry.max_attempts() as usize {
                    warn!(error = ?report, "export retries exhausted, giving up");
                } else {
                    let delay = backoff_delay(&retry, attempt);
                    let job = envelope.payload.clone();
                    let redelivered = Envelope::redeliver(job, envelope.retry_count, delay);
                    if let Err(report) = export_sender.lock().await.send_envelope(redelivered, Priority::Normal).await {
                        warn!(error = ?report, "failed to redeliver export job");
                    }
                }
            }
            Err(report) => warn!(error = ?report, "export job failed permanently"),
        }

        if let Err(report) = guard.commit() {
            warn!(error = ?report, "failed to ack export queue envelope");
        }
    }
}

/// Drain the ingestion queue forever. Ingestion failures are recorded on
/// the `DataSource` itself by [`ingest::ingest`]; there is no redelivery
/// path, since a malformed upload doesn't become well-formed on retry.
pub async fn run_ingest_worker<D: Database>(db: Arc<D>, mut receiver: Receiver<IngestJob>, scan_sender: Arc<Mutex<Sender<CommitTask>>>) {
    loop {
        let guard = match receiver.recv().await {
            Ok(guard) => guard,
            Err(report) => {
                warn!(error = ?report, "failed to receive from ingest queue");
                continue;
            }
        };
        let job = match guard.item() {
            Ok(job) => job,
            Err(report) => {
                warn!(error = ?report, "failed to decode ingest queue envelope, dropping");
                let _ = guard.commit();
                continue;
            }
        };

        if let Err(report) = ingest::ingest(db.as_ref(), &scan_sender, &job).await {
            warn!(error = ?report, data_source_id = %job.data_source_id, "ingestion failed");
        }

        if let Err(report) = guard.commit() {
            warn!(error = ?report, "failed to ack ingest queue envelope");
        }
    }
}
