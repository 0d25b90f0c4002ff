//! Typed domain entities backing the repository store.
//!
//! Mirrors the data model one-for-one: `DataSource`, `Job`, `CommitTask`,
//! `SonarRun`, `DeadLetter`, `Output`. Dynamic config overrides are kept as
//! an opaque JSON blob (the scanner's accepted shape is pluggable and out of
//! scope here), but every field the scheduling/execution core reasons about
//! is an explicit, typed column.

use std::fmt;

use derive_new::new;
use getset::Getters;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque identifier shared by every entity that doesn't have a natural key.
pub type Id = Uuid;

/// Status of a [`DataSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DataSourceStatus {
    /// Uploaded, not yet ingested.
    Pending,
    /// Ingestion is fanning CSV rows out into CommitTasks.
    Processing,
    /// Every Job created from this DataSource has reached a terminal state.
    Ready,
    /// Ingestion or every Job hit an unrecoverable fault.
    Failed,
}

/// An uploaded build-history dataset.
#[derive(Debug, Clone, Getters, new, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct DataSource {
    id: Id,
    name: String,
    source_path: String,
    total_commits: i64,
    /// Scanner config override applied to every commit in this dataset, unless
    /// a `CommitTask` carries its own more specific override.
    config_override: Option<serde_json::Value>,
    status: DataSourceStatus,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

/// Status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, tasks enqueued, no worker has yet run a commit.
    Queued,
    /// At least one task has started executing.
    Running,
    /// `processed + failed_count >= total` and no task failed, or failures
    /// were tolerated per the configured [`crate::config::FailurePolicy`].
    Succeeded,
    /// `processed + failed_count >= total` and the failure policy is
    /// `fail_fast` and at least one task failed.
    Failed,
    /// An operator cancelled the job; no further progress increments apply.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal (no further task completions are expected).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// A single ingestion run: one `Job` per uploaded `DataSource`.
#[derive(Debug, Clone, Getters, new, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct Job {
    id: Id,
    data_source_id: Id,
    total: i64,
    processed: i64,
    failed_count: i64,
    status: JobStatus,
    current_commit: Option<String>,
    assigned_backend_instance: Option<String>,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl Job {
    /// Whether this job has reached its terminal count:
    /// `processed + failed_count >= total`.
    pub fn is_complete(&self) -> bool {
        self.processed + self.failed_count >= self.total
    }
}

/// One unit of work: scan a single commit of a single project.
///
/// Identity is the natural key `(project_key, commit_sha)` — handlers must be
/// idempotent on this pair, since the queue is at-least-once.
#[derive(Debug, Clone, Getters, new, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct CommitTask {
    project_key: String,
    commit_sha: String,
    repo_url: String,
    repo_slug: String,
    config_override: Option<serde_json::Value>,
    job_id: Id,
    data_source_id: Id,
    retry_count: i64,
}

impl CommitTask {
    /// The component key this task's scan is registered under in the
    /// analysis backend: `project_key + "_" + commit_sha`.
    pub fn component_key(&self) -> String {
        component_key(&self.project_key, &self.commit_sha)
    }
}

/// Compute a component key the same way everywhere it's needed, since it's
/// derived independently by the executor, the webhook receiver, and the
/// exporter.
pub fn component_key(project_key: &str, commit_sha: &str) -> String {
    format!("{project_key}_{commit_sha}")
}

/// Status of a [`SonarRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SonarRunStatus {
    /// The executor has claimed this triple and is scanning it.
    Running,
    /// The scanner exited zero; awaiting the backend's webhook callback.
    Submitted,
    /// The idempotency pre-check found an existing component; no scan ran.
    Skipped,
    /// Metrics were fetched and appended to the output file.
    Succeeded,
    /// The scan, or the export following it, failed permanently.
    Failed,
}

impl SonarRunStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// A scan of one `(data_source, project, commit)` triple against one backend
/// instance. Upserted by the executor, updated by the webhook receiver and
/// the exporter.
#[derive(Debug, Clone, Getters, new, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct SonarRun {
    data_source_id: Id,
    project_key: String,
    commit_sha: String,
    component_key: String,
    status: SonarRunStatus,
    backend_instance: String,
    analysis_id: Option<String>,
    log_ref: Option<String>,
    metrics_path: Option<String>,
    message: Option<String>,
    started_at: OffsetDateTime,
    finished_at: Option<OffsetDateTime>,
}

/// Why a [`DeadLetter`] was created, consolidating the original's two
/// overlapping `dead_letters`/`failed_commits` collections into one typed
/// field (see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterReason {
    /// The scanner exited non-zero.
    ScanFailed,
    /// The commit was absent from both the canonical repo and every
    /// searched fork.
    MissingFork,
    /// Task payload referenced a project that no longer exists.
    ProjectMissing,
    /// Task payload was structurally invalid (missing required fields).
    Validation,
}

/// Status of a [`DeadLetter`] as seen by the operator workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Awaiting operator attention.
    Pending,
    /// An operator has re-enqueued this task (possibly with an edited override).
    Queued,
    /// The re-enqueued task completed successfully.
    Resolved,
}

/// A task persisted for operator attention after exhausted or non-retryable
/// failure. Always carries the original payload so the operator can
/// re-enqueue untouched or with a modified override.
#[derive(Debug, Clone, Getters, new, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct DeadLetter {
    id: Id,
    payload: CommitTask,
    reason: DeadLetterReason,
    status: DeadLetterStatus,
    config_override: Option<serde_json::Value>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

/// An append-only per-project metrics output, one row per exported commit.
#[derive(Debug, Clone, Getters, new, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct Output {
    job_id: Id,
    path: String,
    project_key: String,
    repo_name: String,
    /// The ordered set of metric keys this file's header row declares.
    metrics: Vec<String>,
    record_count: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl fmt::Display for CommitTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.project_key, self.commit_sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_key_formats_owner_slug_and_commit() {
        assert_eq!(component_key("owner/repo", "abc123"), "owner/repo_abc123");
    }

    #[test]
    fn job_completion_counts_failures() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let job = Job {
            id: Uuid::nil(),
            data_source_id: Uuid::nil(),
            total: 3,
            processed: 2,
            failed_count: 1,
            status: JobStatus::Running,
            current_commit: None,
            assigned_backend_instance: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(job.is_complete());
    }
}
