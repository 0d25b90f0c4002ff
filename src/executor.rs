//! The commit executor: the hot path that turns one `CommitTask` into a
//! submitted (or skipped) scan.
//!
//! Bundles the collaborators a task execution needs — the repository store,
//! the worktree manager, the scanner, and fork discovery — into a `Deps`
//! struct, generic over the repository store implementation the way the
//! rest of this crate is.

use std::sync::Arc;

use error_stack::{IntoReport, Result, ResultExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    backend,
    config::{BackendInstance, FailurePolicy},
    db::{Database, NewCommitTask},
    ext::error_stack::DescribeContext,
    exporter::ExportJob,
    fork_finder,
    model::{CommitTask, DeadLetterReason, Id, JobStatus, SonarRunStatus},
    queue::{Priority, Queue, Sender},
    scanner::{self, Scanner},
    worktree::WorktreeManager,
};

/// Errors encountered executing a commit task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The task payload was missing a required field.
    #[error("commit task payload is malformed")]
    Validation,

    /// The idempotency pre-check against the analysis backend failed.
    #[error("check analysis backend for existing component")]
    PreCheck,

    /// A repository store operation failed.
    #[error("query or update repository store")]
    Persist,

    /// Preparing a worktree at the requested commit failed for a reason
    /// other than the commit being absent.
    #[error("prepare worktree")]
    Worktree,

    /// The commit is absent from both the canonical repo and every fork
    /// that could be searched. Permanent: direct to dead letter.
    #[error("commit absent from origin and every searched fork")]
    MissingFork,

    /// Fork discovery itself failed (distinct from the commit simply not
    /// being found in any fork).
    #[error("search forks for missing commit")]
    ForkSearch,

    /// Materializing an override config file failed.
    #[error("write override config")]
    OverrideConfig,

    /// The scanner exited non-zero. The executor has already recorded this
    /// as a terminal failure (SonarRun, Job, DeadLetter); callers should ack
    /// the task rather than retry or dead-letter it again.
    #[error("scanner exited non-zero")]
    ScanFailed,

    /// Enqueuing the follow-up export job failed.
    #[error("enqueue export job")]
    EnqueueExport,
}

impl Error {
    /// Whether this failure is permanent: the executor has already recorded
    /// it as terminal (SonarRun failed, Job counters updated, DeadLetter
    /// inserted where applicable) and the caller should simply acknowledge
    /// the queue message rather than retry it.
    ///
    /// `Validation` is the one permanent variant the executor itself does
    /// *not* record, since a malformed payload means there's no reliable
    /// `component_key` to record anything under; the caller is expected to
    /// dead-letter it directly using the raw envelope.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Validation | Self::MissingFork | Self::ScanFailed)
    }

    /// The `DeadLetterReason` a caller should use if it ends up dead-
    /// lettering a task that failed with this error (either because this
    /// variant didn't self-record, or because retries were exhausted on a
    /// temporary variant).
    pub fn dead_letter_reason(&self) -> DeadLetterReason {
        match self {
            Self::Validation => DeadLetterReason::Validation,
            Self::MissingFork => DeadLetterReason::MissingFork,
            _ => DeadLetterReason::ScanFailed,
        }
    }
}

/// Collaborators shared across every task execution against one backend
/// instance. Constructed once at worker startup and passed by reference to
/// every [`execute`] call; cheap to `Clone` since the expensive pieces are
/// wrapped in `Arc`.
pub struct Deps<D> {
    /// The repository store.
    pub db: Arc<D>,
    /// Manages clones and per-commit worktrees.
    pub worktree: Arc<WorktreeManager>,
    /// Invokes the configured scanner binary.
    pub scanner: Arc<Scanner>,
    /// The analysis backend instance this executor dispatches to.
    pub backend_instance: BackendInstance,
    /// Fork discovery client, absent if no hosting-API tokens are configured.
    pub fork_finder: Option<Arc<fork_finder::Client>>,
    /// The hosting API's base URL, used to derive clone URLs for guessed and
    /// discovered fork remotes.
    pub fork_finder_api_base: url::Url,
    /// Bound on how many fork pages to walk before giving up.
    pub fork_finder_max_pages: u32,
    /// Whether a commit failure stops the whole job or is tolerated.
    pub failure_policy: FailurePolicy,
}

// Implemented by hand rather than `#[derive(Clone)]`: the derive would add
// an unconditional `D: Clone` bound even though every field referencing `D`
// is already behind an `Arc`, which would make `Deps<SqliteDatabase>`
// uncloneable since the repository store itself doesn't implement `Clone`.
impl<D> Clone for Deps<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            worktree: Arc::clone(&self.worktree),
            scanner: Arc::clone(&self.scanner),
            backend_instance: self.backend_instance.clone(),
            fork_finder: self.fork_finder.clone(),
            fork_finder_api_base: self.fork_finder_api_base.clone(),
            fork_finder_max_pages: self.fork_finder_max_pages,
            failure_policy: self.failure_policy,
        }
    }
}

/// Execute one commit task to completion: idempotency check, worktree
/// checkout (with fork fallback), scan, and progress bookkeeping.
///
/// On success, the follow-up export is enqueued onto `export_sender` (either
/// immediately, for the idempotency-skip path, or implicitly later, once the
/// analysis backend's webhook reports completion for the submitted scan).
#[tracing::instrument(skip_all, fields(task = %task, component_key))]
pub async fn execute<D: Database>(
    deps: &Deps<D>,
    export_sender: &Mutex<Sender<ExportJob>>,
    task: CommitTask,
) -> Result<(), Error> {
    validate(&task)?;
    let component_key = task.component_key();
    tracing::Span::current().record("component_key", tracing::field::display(&component_key));

    let client = backend::Client::new(&deps.backend_instance).change_context(Error::PreCheck)?;
    let exists = client
        .component_exists(&component_key)
        .await
        .change_context(Error::PreCheck)
        .describe_lazy(|| format!("check idempotency pre-check for '{component_key}'"))?;

    if exists {
        return skip(deps, export_sender, &task, &component_key).await;
    }

    let result = run_scan(deps, &task, &component_key).await;
    match result {
        Ok(()) => {
            advance_job(deps, &task, true, None).await?;
            Ok(())
        }
        Err(report) if matches!(report.current_context(), Error::MissingFork) => {
            fail_terminally(deps, &task, &component_key, DeadLetterReason::MissingFork, "commit absent from origin and every searched fork").await?;
            Err(report)
        }
        Err(report) if matches!(report.current_context(), Error::ScanFailed) => {
            // `run_scan` has already upserted the failed SonarRun and
            // recorded the combined output; only the job/dead-letter
            // bookkeeping remains.
            let message = format!("{report:#}");
            fail_terminally(deps, &task, &component_key, DeadLetterReason::ScanFailed, &message).await?;
            Err(report)
        }
        Err(report) => Err(report),
    }
}

/// Reject obviously-malformed payloads before any I/O.
fn validate(task: &CommitTask) -> Result<(), Error> {
    if task.project_key().is_empty() || task.commit_sha().is_empty() || task.repo_url().is_empty() {
        return Err(Error::Validation)
            .into_report()
            .describe("a CommitTask must have non-empty project_key, commit_sha, and repo_url");
    }
    Ok(())
}

/// The idempotency-skip path: the component already exists on the backend,
/// so no scan runs; record `skipped` and enqueue the export directly.
async fn skip<D: Database>(
    deps: &Deps<D>,
    export_sender: &Mutex<Sender<ExportJob>>,
    task: &CommitTask,
    component_key: &str,
) -> Result<(), Error> {
    info!("component already exists on backend, skipping scan");
    deps.db
        .upsert_sonar_run_running(*task.data_source_id(), task.project_key(), task.commit_sha(), component_key, deps.backend_instance.name())
        .await
        .change_context(Error::Persist)?;
    deps.db
        .update_sonar_run(component_key, SonarRunStatus::Skipped, None, None, None, Some("component already registered on backend"))
        .await
        .change_context(Error::Persist)?;

    export_sender
        .lock()
        .await
        .send(
            ExportJob::skipped(component_key.to_string(), *task.job_id(), *task.data_source_id()),
            Priority::Normal,
        )
        .await
        .change_context(Error::EnqueueExport)?;

    advance_job(deps, task, true, None).await
}

/// Claim the SonarRun, prepare a worktree, detect project kind, materialize
/// an override, scan, and record the submitted run.
async fn run_scan<D: Database>(deps: &Deps<D>, task: &CommitTask, component_key: &str) -> Result<(), Error> {
    deps.db
        .upsert_sonar_run_running(*task.data_source_id(), task.project_key(), task.commit_sha(), component_key, deps.backend_instance.name())
        .await
        .change_context(Error::Persist)?;

    let worktree_dir = checkout_with_fork_fallback(deps, task).await?;

    let kind = scanner::detect_project_kind(&worktree_dir);
    info!(?kind, "detected project kind");

    let override_path = match task.config_override() {
        Some(value) => {
            let content = serde_json::to_vec(value)
                .into_report()
                .change_context(Error::OverrideConfig)
                .describe("serialize commit task's override config")?;
            Some(deps.worktree.ensure_override_config(&content).await.change_context(Error::OverrideConfig)?)
        }
        None => None,
    };

    let scan_result = deps.scanner.scan(&worktree_dir, component_key, override_path.as_deref()).await;

    // The worktree is released whether the scan succeeded or failed; the
    // lock is reacquired briefly for this and is never held during the
    // scan itself.
    if let Err(release_report) = deps
        .worktree
        .remove_worktree(deps.backend_instance.name(), task.project_key(), task.commit_sha())
        .await
    {
        warn!(error = ?release_report, "failed to release worktree after scan");
    }

    match scan_result {
        Ok(outcome) => {
            deps.db
                .update_sonar_run(component_key, SonarRunStatus::Submitted, None, Some(&log_ref(&outcome.stdout)), None, None)
                .await
                .change_context(Error::Persist)?;
            Ok(())
        }
        Err(report) => {
            let combined_output = format!("{report:#}");
            deps.db
                .update_sonar_run(component_key, SonarRunStatus::Failed, None, None, None, Some(&combined_output))
                .await
                .change_context(Error::Persist)?;
            Err(report).change_context(Error::ScanFailed)
        }
    }
}

/// A short reference to the scanner's own output, since this crate doesn't
/// manage log storage; truncated so a verbose scanner doesn't bloat the row.
fn log_ref(stdout: &str) -> String {
    const MAX_LEN: usize = 4096;
    if stdout.len() > MAX_LEN {
        let boundary = stdout
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= MAX_LEN)
            .last()
            .unwrap_or(0);
        format!("{}... (truncated)", &stdout[..boundary])
    } else {
        stdout.to_string()
    }
}

/// Prepare a worktree at the task's commit, escalating to a full fork search
/// if the commit is absent from origin and a first guessed fallback remote
/// (derived directly from `repo_slug`) doesn't have it either.
async fn checkout_with_fork_fallback<D: Database>(deps: &Deps<D>, task: &CommitTask) -> Result<std::path::PathBuf, Error> {
    let guessed_fork = deps
        .fork_finder
        .as_ref()
        .filter(|_| !task.repo_slug().is_empty())
        .map(|_| fork_finder::to_git_url(&deps.fork_finder_api_base, task.repo_slug()));

    let first_attempt = deps
        .worktree
        .checkout_commit(
            deps.backend_instance.name(),
            task.project_key(),
            task.repo_url(),
            task.commit_sha(),
            guessed_fork.as_deref(),
        )
        .await;

    match first_attempt {
        Ok(path) => Ok(path),
        Err(report) if matches!(report.current_context(), crate::worktree::Error::CommitMissing) => {
            escalate_to_fork_search(deps, task).await
        }
        Err(report) => Err(report).change_context(Error::Worktree),
    }
}

/// Run the fuller fork-discovery search and retry the worktree checkout
/// against whatever fork is found, if any.
async fn escalate_to_fork_search<D: Database>(deps: &Deps<D>, task: &CommitTask) -> Result<std::path::PathBuf, Error> {
    let Some(client) = deps.fork_finder.as_ref() else {
        return Err(Error::MissingFork)
            .into_report()
            .describe("no fork discovery client is configured, and the commit is absent from origin");
    };

    let found = client
        .find_commit_repo(task.repo_slug(), task.commit_sha(), deps.fork_finder_max_pages)
        .await
        .change_context(Error::ForkSearch)?;

    let Some(fork_slug) = found else {
        return Err(Error::MissingFork)
            .into_report()
            .describe_lazy(|| format!("commit '{}' not found in '{}' or any of its forks", task.commit_sha(), task.repo_slug()));
    };

    let fork_url = fork_finder::to_git_url(&deps.fork_finder_api_base, &fork_slug);
    deps.worktree
        .checkout_commit(
            deps.backend_instance.name(),
            task.project_key(),
            task.repo_url(),
            task.commit_sha(),
            Some(&fork_url),
        )
        .await
        .change_context(Error::MissingFork)
        .describe_lazy(|| format!("commit was reported present in fork '{fork_slug}' but still could not be fetched"))
}

/// Record a permanent, terminal failure: update the Job's failure counters
/// and insert a DeadLetter. The SonarRun itself has already been marked
/// `failed` by the caller (or, for `MissingFork`, is marked here).
async fn fail_terminally<D: Database>(
    deps: &Deps<D>,
    task: &CommitTask,
    component_key: &str,
    reason: DeadLetterReason,
    message: &str,
) -> Result<(), Error> {
    if reason == DeadLetterReason::MissingFork {
        deps.db
            .update_sonar_run(component_key, SonarRunStatus::Failed, None, None, None, Some(message))
            .await
            .change_context(Error::Persist)?;
    }

    deps.db
        .insert_dead_letter(task.clone(), reason, task.config_override().clone())
        .await
        .change_context(Error::Persist)?;

    advance_job(deps, task, false, Some(message)).await
}

/// Increment the Job's progress counters and, if this was its last
/// outstanding commit, recompute its terminal status and release the
/// backend admission slot it's been holding.
async fn advance_job<D: Database>(deps: &Deps<D>, task: &CommitTask, succeeded: bool, failure_message: Option<&str>) -> Result<(), Error> {
    let job = if succeeded {
        deps.db.increment_job_processed(*task.job_id()).await.change_context(Error::Persist)?
    } else {
        deps.db
            .increment_job_failed(*task.job_id(), failure_message.unwrap_or("commit task failed"))
            .await
            .change_context(Error::Persist)?
    };

    finalize_job_if_complete(deps.db.as_ref(), job, deps.failure_policy, deps.backend_instance.name())
        .await
        .change_context(Error::Persist)
}

/// Recompute a job's terminal status, finalizing it if `processed +
/// failed_count >= total`: set its and its owning data source's terminal
/// status, and release the backend admission slot it's been holding.
///
/// Shared by the executor's direct increment path above and
/// [`crate::reconciler`]'s sweep path, rather than each duplicating the
/// `is_complete` comparison and finalization side effects.
pub async fn finalize_job_if_complete<D: Database>(
    db: &D,
    job: crate::model::Job,
    failure_policy: FailurePolicy,
    backend_instance: &str,
) -> Result<(), crate::db::Error> {
    if !job.is_complete() {
        return Ok(());
    }

    let final_status = match failure_policy {
        FailurePolicy::FailFast if *job.failed_count() > 0 => JobStatus::Failed,
        _ => JobStatus::Succeeded,
    };

    db.set_job_status(*job.id(), final_status).await?;
    db.set_data_source_status(
        *job.data_source_id(),
        if final_status == JobStatus::Succeeded {
            crate::model::DataSourceStatus::Ready
        } else {
            crate::model::DataSourceStatus::Failed
        },
    )
    .await?;
    db.release_admission(backend_instance, *job.id()).await?;

    Ok(())
}

/// Build a `NewCommitTask` for ingestion, separated from [`CommitTask`]
/// itself since the latter carries fields (`retry_count`) that don't exist
/// until the first enqueue.
pub fn new_commit_task(
    project_key: impl Into<String>,
    commit_sha: impl Into<String>,
    repo_url: impl Into<String>,
    repo_slug: impl Into<String>,
    config_override: Option<serde_json::Value>,
    job_id: Id,
    data_source_id: Id,
) -> NewCommitTask {
    NewCommitTask {
        project_key: project_key.into(),
        commit_sha: commit_sha.into(),
        repo_url: repo_url.into(),
        repo_slug: repo_slug.into(),
        config_override,
        job_id,
        data_source_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> CommitTask {
        CommitTask::new(
            "owner/repo".to_string(),
            "deadbeef".to_string(),
            "https://example.com/owner/repo.git".to_string(),
            "owner/repo".to_string(),
            None,
            Id::nil(),
            Id::nil(),
            0,
        )
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let mut task = sample_task();
        // CommitTask has no setters, so rebuild with an empty field instead.
        task = CommitTask::new(
            String::new(),
            task.commit_sha().clone(),
            task.repo_url().clone(),
            task.repo_slug().clone(),
            None,
            *task.job_id(),
            *task.data_source_id(),
            0,
        );
        assert!(validate(&task).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_task() {
        assert!(validate(&sample_task()).is_ok());
    }

    #[test]
    fn is_permanent_classifies_correctly() {
        assert!(Error::Validation.is_permanent());
        assert!(Error::MissingFork.is_permanent());
        assert!(Error::ScanFailed.is_permanent());
        assert!(!Error::Persist.is_permanent());
        assert!(!Error::ForkSearch.is_permanent());
    }

    #[test]
    fn dead_letter_reason_maps_known_permanent_variants() {
        assert_eq!(Error::Validation.dead_letter_reason(), DeadLetterReason::Validation);
        assert_eq!(Error::MissingFork.dead_letter_reason(), DeadLetterReason::MissingFork);
        assert_eq!(Error::Persist.dead_letter_reason(), DeadLetterReason::ScanFailed);
    }

    #[test]
    fn log_ref_truncates_long_output() {
        let long = "x".repeat(5000);
        let truncated = log_ref(&long);
        assert!(truncated.ends_with("(truncated)"));
        assert!(truncated.len() < long.len());
    }

    #[test]
    fn log_ref_passes_through_short_output() {
        assert_eq!(log_ref("ok"), "ok");
    }

    #[test]
    fn log_ref_truncates_multibyte_output_without_panicking() {
        // Each "é" is 2 bytes, so a byte-offset truncation at exactly 4096
        // would land mid-character for this input; this must not panic.
        let long = "é".repeat(5000);
        let truncated = log_ref(&long);
        assert!(truncated.ends_with("(truncated)"));
        assert!(truncated.len() < long.len());
    }
}
