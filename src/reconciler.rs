//! Periodic sweeper recovering work stranded by a crashed or wedged worker:
//! commit tasks claimed but never completed, and `SonarRun`s left `running`
//! past the point a scan could plausibly still be in flight.
//!
//! Shaped as a simple `for _ in 0.. { sweep(); sleep(interval) }` loop.

use std::{sync::Arc, time::Duration as StdDuration};

use error_stack::{IntoReport, Result, ResultExt};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::FailurePolicy,
    db::Database,
    executor,
    ext::error_stack::DescribeContext,
    model::{CommitTask, SonarRunStatus},
    queue::{Priority, Sender},
};

/// How much older than "now" a claimed commit task must be before the
/// reconciler considers its claim abandoned.
pub const CLAIMED_TIMEOUT: StdDuration = StdDuration::from_secs(30 * 60);

/// How much older than "now" a `running` SonarRun must be before the
/// reconciler considers its scan stalled.
pub const RUNNING_TIMEOUT: StdDuration = StdDuration::from_secs(15 * 60);

/// Errors encountered during a reconciliation sweep.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A repository store query or update failed.
    #[error("query or update repository store")]
    Persist,

    /// Re-enqueuing a reverted commit task failed.
    #[error("re-enqueue commit task")]
    Enqueue,

    /// A stale SonarRun's natural key has no corresponding CommitTask,
    /// which should be impossible barring a bug elsewhere in this crate.
    #[error("stale record has no corresponding commit task")]
    Inconsistent,
}

/// Counts of what one sweep did, returned for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Claimed commit tasks reverted and re-enqueued.
    pub reclaimed_tasks: usize,
    /// Stale `running` SonarRuns marked failed.
    pub stalled_runs: usize,
}

/// Run one reconciliation sweep: revert and re-enqueue commit tasks claimed
/// longer ago than [`CLAIMED_TIMEOUT`], and fail out SonarRuns left
/// `running` longer than [`RUNNING_TIMEOUT`].
pub async fn sweep<D: Database>(
    db: &D,
    scan_sender: &Mutex<Sender<CommitTask>>,
    failure_policy: FailurePolicy,
) -> Result<SweepReport, Error> {
    let now = OffsetDateTime::now_utc();
    let claimed_cutoff = now - time::Duration::try_from(CLAIMED_TIMEOUT).expect("constant fits time::Duration");
    let running_cutoff = now - time::Duration::try_from(RUNNING_TIMEOUT).expect("constant fits time::Duration");
    sweep_with_cutoffs(db, scan_sender, claimed_cutoff, running_cutoff, failure_policy).await
}

/// The cutoff-parameterized implementation of [`sweep`], split out so tests
/// can exercise it without waiting out the real 15/30 minute timeouts.
#[tracing::instrument(skip(db, scan_sender))]
async fn sweep_with_cutoffs<D: Database>(
    db: &D,
    scan_sender: &Mutex<Sender<CommitTask>>,
    claimed_cutoff: OffsetDateTime,
    running_cutoff: OffsetDateTime,
    failure_policy: FailurePolicy,
) -> Result<SweepReport, Error> {
    let mut report = SweepReport::default();

    let stale_claimed = db
        .stale_claimed_commit_tasks(claimed_cutoff)
        .await
        .change_context(Error::Persist)?;
    for task in stale_claimed {
        if let Err(report) = reclaim_task(db, scan_sender, task).await {
            warn!(error = ?report, "failed to reclaim stale commit task");
            continue;
        }
        report.reclaimed_tasks += 1;
    }

    let stale_running = db
        .stale_running_sonar_runs(running_cutoff)
        .await
        .change_context(Error::Persist)?;
    for run in stale_running {
        if let Err(report) = fail_stalled_run(db, &run, failure_policy).await {
            warn!(error = ?report, "failed to fail out stalled SonarRun");
            continue;
        }
        report.stalled_runs += 1;
    }

    if report.reclaimed_tasks > 0 || report.stalled_runs > 0 {
        info!(
            reclaimed_tasks = report.reclaimed_tasks,
            stalled_runs = report.stalled_runs,
            "reconciliation sweep repaired stale work"
        );
    }

    Ok(report)
}

/// Revert one claimed task's claim and re-enqueue it, bumping its
/// persisted retry counter so a task that keeps getting abandoned
/// eventually exhausts its retry budget the same way a task that keeps
/// failing outright does.
async fn reclaim_task<D: Database>(db: &D, scan_sender: &Mutex<Sender<CommitTask>>, task: CommitTask) -> Result<(), Error> {
    let retry_count = db
        .increment_commit_task_retry(task.project_key(), task.commit_sha())
        .await
        .change_context(Error::Persist)?;
    db.unclaim_commit_task(task.project_key(), task.commit_sha())
        .await
        .change_context(Error::Persist)?;

    let reverted = CommitTask::new(
        task.project_key().clone(),
        task.commit_sha().clone(),
        task.repo_url().clone(),
        task.repo_slug().clone(),
        task.config_override().clone(),
        *task.job_id(),
        *task.data_source_id(),
        retry_count,
    );

    let envelope = crate::queue::Envelope::redeliver(reverted, retry_count - 1, StdDuration::ZERO);
    scan_sender
        .lock()
        .await
        .send_envelope(envelope, Priority::Normal)
        .await
        .change_context(Error::Enqueue)
        .describe_lazy(|| format!("re-enqueue reclaimed task '{}'@'{}'", task.project_key(), task.commit_sha()))
}

/// Fail out one SonarRun stuck `running` past the timeout: mark it failed
/// and recompute the owning job's terminality, since a worker that died
/// mid-scan never got the chance to record either.
async fn fail_stalled_run<D: Database>(db: &D, run: &crate::model::SonarRun, failure_policy: FailurePolicy) -> Result<(), Error> {
    db.update_sonar_run(
        run.component_key(),
        SonarRunStatus::Failed,
        None,
        None,
        None,
        Some("reconciler: scan stalled past the running timeout"),
    )
    .await
    .change_context(Error::Persist)?;

    let task = db
        .get_commit_task(run.project_key(), run.commit_sha())
        .await
        .change_context(Error::Persist)?
        .ok_or(Error::Inconsistent)
        .into_report()
        .describe_lazy(|| format!("no CommitTask for stalled SonarRun '{}'@'{}'", run.project_key(), run.commit_sha()))?;

    let job = db
        .increment_job_failed(*task.job_id(), "scan stalled past the running timeout")
        .await
        .change_context(Error::Persist)?;

    executor::finalize_job_if_complete(db, job, failure_policy, run.backend_instance())
        .await
        .change_context(Error::Persist)
}

/// Run the reconciliation sweep forever, once per `interval` (by default,
/// every 10 minutes).
pub async fn run<D: Database>(
    db: Arc<D>,
    scan_sender: Arc<Mutex<Sender<CommitTask>>>,
    interval: StdDuration,
    failure_policy: FailurePolicy,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so a fresh process doesn't
    // sweep before anything has had a chance to go stale.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(report) = sweep(db.as_ref(), &scan_sender, failure_policy).await {
            warn!(error = ?report, "reconciliation sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{db::connect_sqlite, queue};

    #[tokio::test]
    async fn sweep_reverts_and_reenqueues_stale_claimed_tasks() {
        let dir = tempdir().expect("tempdir");
        let db = connect_sqlite(&dir.path().join("db.sqlite")).await.expect("connect");

        let source = db.create_data_source("ds", "/tmp/ds.csv", 1, None).await.expect("create data source");
        let job = db.create_job(*source.id(), 1).await.expect("create job");
        db.create_commit_task(executor::new_commit_task(
            "owner/repo",
            "deadbeef",
            "https://example.com/owner/repo.git",
            "owner/repo",
            None,
            *job.id(),
            *source.id(),
        ))
        .await
        .expect("create commit task");
        db.claim_commit_task("owner/repo", "deadbeef").await.expect("claim");

        let ctx = crate::AppContext::new(dir.path().to_path_buf());
        let (tx, mut rx) = queue::open::<CommitTask>(&ctx, queue::Queue::Scan).await.expect("open queue");
        let tx = Mutex::new(tx);

        // A cutoff an hour in the future makes the just-created claim look stale.
        let future = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let report = sweep_with_cutoffs(&db, &tx, future, future, FailurePolicy::ResumeFailedCommits)
            .await
            .expect("sweep");
        assert_eq!(report.reclaimed_tasks, 1);

        let guard = rx.recv().await.expect("must receive reclaimed task");
        let item = guard.item().expect("decode");
        assert_eq!(item.project_key(), "owner/repo");
        guard.commit().expect("commit");
    }

    #[tokio::test]
    async fn sweep_fails_out_stalled_running_runs() {
        let dir = tempdir().expect("tempdir");
        let db = connect_sqlite(&dir.path().join("db.sqlite")).await.expect("connect");

        let source = db.create_data_source("ds", "/tmp/ds.csv", 1, None).await.expect("create data source");
        let job = db.create_job(*source.id(), 1).await.expect("create job");
        db.create_commit_task(executor::new_commit_task(
            "owner/repo",
            "deadbeef",
            "https://example.com/owner/repo.git",
            "owner/repo",
            None,
            *job.id(),
            *source.id(),
        ))
        .await
        .expect("create commit task");
        db.upsert_sonar_run_running(*source.id(), "owner/repo", "deadbeef", "owner/repo_deadbeef", "backend-a")
            .await
            .expect("upsert running");

        let ctx = crate::AppContext::new(dir.path().to_path_buf());
        let (tx, _rx) = queue::open::<CommitTask>(&ctx, queue::Queue::Scan).await.expect("open queue");
        let tx = Mutex::new(tx);

        let future = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let report = sweep_with_cutoffs(&db, &tx, future, future, FailurePolicy::ResumeFailedCommits)
            .await
            .expect("sweep");
        assert_eq!(report.stalled_runs, 1);

        let run = db
            .get_sonar_run_by_component_key("owner/repo_deadbeef")
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(*run.status(), SonarRunStatus::Failed);

        let updated_job = db.get_job(*job.id()).await.expect("query").expect("exists");
        assert_eq!(*updated_job.status(), crate::model::JobStatus::Succeeded);
    }
}
