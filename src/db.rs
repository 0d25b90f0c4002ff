//! Interface for interacting with the repository store, abstracted over
//! database implementation.

use std::path::Path;

use async_trait::async_trait;
use error_stack::{Result, ResultExt};
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::{
    CommitTask, DataSource, DataSourceStatus, DeadLetter, DeadLetterReason, DeadLetterStatus, Id,
    Job, JobStatus, Output, SonarRun, SonarRunStatus,
};

mod sqlite;

pub use sqlite::Database as SqliteDatabase;

/// Errors interacting with the repository store.
#[derive(Debug, Error)]
pub enum Error {
    /// Encountered when initializing the database.
    #[error("initialize database")]
    Initialize,

    /// Encountered at runtime interacting with the database.
    #[error("interact with the database")]
    Interact,

    /// Encountered when the previous version of this crate to use the
    /// database was newer than the current version.
    ///
    /// Applications should refuse to run when this error is encountered.
    #[error("newer version of this tool has used this database")]
    SchemaOutdated,

    /// The requested entity does not exist.
    #[error("entity not found")]
    NotFound,
}

/// A newly-created commit task, before it is assigned an `enqueued_at`.
#[derive(Debug, Clone)]
pub struct NewCommitTask {
    /// See [`CommitTask`].
    pub project_key: String,
    /// See [`CommitTask`].
    pub commit_sha: String,
    /// See [`CommitTask`].
    pub repo_url: String,
    /// See [`CommitTask`].
    pub repo_slug: String,
    /// See [`CommitTask`].
    pub config_override: Option<serde_json::Value>,
    /// See [`CommitTask`].
    pub job_id: Id,
    /// See [`CommitTask`].
    pub data_source_id: Id,
}

/// The result of a conditional admission acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was acquired.
    Acquired,
    /// No slot was free.
    Denied,
}

/// Current admission state for one backend instance.
#[derive(Debug, Clone)]
pub struct AdmissionCapacity {
    /// Number of slots currently in use.
    pub active: i64,
    /// Configured maximum concurrent slots.
    pub max: i64,
    /// Job ids currently holding a slot.
    pub job_ids: Vec<Id>,
}

impl AdmissionCapacity {
    /// Number of free slots.
    pub fn available(&self) -> i64 {
        (self.max - self.active).max(0)
    }
}

/// All repository store implementations implement this trait.
///
/// Covers the full entity set this domain needs: DataSource, Job,
/// CommitTask, SonarRun, DeadLetter, Output, plus the admission ledger.
#[async_trait]
pub trait Database: Send + Sync {
    /// The last version of this tool used to access the database.
    async fn schema_version(&self) -> Result<Option<semver::Version>, Error>;

    /// Set the current version as the last used version to access the
    /// database, refusing if the stored version is newer than current.
    async fn claim_schema_version(&self) -> Result<(), Error>;

    // --- DataSource ---------------------------------------------------

    /// Create a new data source in `pending` status.
    async fn create_data_source(
        &self,
        name: &str,
        source_path: &str,
        total_commits: i64,
        config_override: Option<serde_json::Value>,
    ) -> Result<DataSource, Error>;

    /// Fetch a data source by id.
    async fn get_data_source(&self, id: Id) -> Result<Option<DataSource>, Error>;

    /// Update a data source's status.
    async fn set_data_source_status(&self, id: Id, status: DataSourceStatus) -> Result<(), Error>;

    // --- Job ------------------------------------------------------------

    /// Create a new job in `queued` status for a data source.
    async fn create_job(&self, data_source_id: Id, total: i64) -> Result<Job, Error>;

    /// Fetch a job by id.
    async fn get_job(&self, id: Id) -> Result<Option<Job>, Error>;

    /// Atomically increment `Job.processed` by one, recompute terminality,
    /// and return the updated job.
    async fn increment_job_processed(&self, id: Id) -> Result<Job, Error>;

    /// Atomically increment `Job.failed_count` by one, recompute
    /// terminality, and return the updated job.
    async fn increment_job_failed(&self, id: Id, last_error: &str) -> Result<Job, Error>;

    /// Directly set a job's status (used by admission re-queue and operator
    /// cancellation).
    async fn set_job_status(&self, id: Id, status: JobStatus) -> Result<(), Error>;

    /// Record the commit currently being processed and the backend instance
    /// assigned to this job.
    async fn set_job_progress_markers(
        &self,
        id: Id,
        current_commit: Option<&str>,
        assigned_backend_instance: Option<&str>,
    ) -> Result<(), Error>;

    // --- CommitTask -------------------------------------------------------

    /// Persist a commit task at ingestion time.
    async fn create_commit_task(&self, task: NewCommitTask) -> Result<(), Error>;

    /// Fetch a commit task by its natural key.
    async fn get_commit_task(
        &self,
        project_key: &str,
        commit_sha: &str,
    ) -> Result<Option<CommitTask>, Error>;

    /// Mark a commit task as claimed by a worker (for reconciler staleness checks).
    async fn claim_commit_task(&self, project_key: &str, commit_sha: &str) -> Result<(), Error>;

    /// Increment a commit task's retry counter, returning the new value.
    async fn increment_commit_task_retry(
        &self,
        project_key: &str,
        commit_sha: &str,
    ) -> Result<i64, Error>;

    /// Commit tasks claimed longer ago than `older_than`, for the reconciler
    /// to revert to unclaimed and re-enqueue.
    async fn stale_claimed_commit_tasks(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<CommitTask>, Error>;

    /// Revert a commit task's claim so the reconciler's re-enqueue is idempotent.
    async fn unclaim_commit_task(&self, project_key: &str, commit_sha: &str) -> Result<(), Error>;

    // --- SonarRun ---------------------------------------------------------

    /// Upsert a `SonarRun` into `running`, as done at the start of execution.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_sonar_run_running(
        &self,
        data_source_id: Id,
        project_key: &str,
        commit_sha: &str,
        component_key: &str,
        backend_instance: &str,
    ) -> Result<SonarRun, Error>;

    /// Fetch a `SonarRun` by its secondary index, the component key.
    async fn get_sonar_run_by_component_key(
        &self,
        component_key: &str,
    ) -> Result<Option<SonarRun>, Error>;

    /// Update a `SonarRun`'s status and optional associated fields.
    #[allow(clippy::too_many_arguments)]
    async fn update_sonar_run(
        &self,
        component_key: &str,
        status: SonarRunStatus,
        analysis_id: Option<&str>,
        log_ref: Option<&str>,
        metrics_path: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), Error>;

    /// `SonarRun`s in `running` older than `older_than`, for the reconciler.
    async fn stale_running_sonar_runs(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<SonarRun>, Error>;

    // --- DeadLetter ---------------------------------------------------------

    /// Insert a dead letter, always carrying the original task payload.
    async fn insert_dead_letter(
        &self,
        payload: CommitTask,
        reason: DeadLetterReason,
        config_override: Option<serde_json::Value>,
    ) -> Result<DeadLetter, Error>;

    /// Fetch a dead letter by id.
    async fn get_dead_letter(&self, id: Id) -> Result<Option<DeadLetter>, Error>;

    /// List dead letters, optionally filtered by status.
    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, Error>;

    /// Mark a dead letter as queued (operator requested re-enqueue) or
    /// resolved (the re-enqueued task succeeded).
    async fn set_dead_letter_status(&self, id: Id, status: DeadLetterStatus) -> Result<(), Error>;

    /// Replace a dead letter's `config_override`, so an operator can adjust
    /// the scanner configuration before re-enqueueing a failed task.
    async fn set_dead_letter_override(
        &self,
        id: Id,
        config_override: Option<serde_json::Value>,
    ) -> Result<(), Error>;

    // --- Output -------------------------------------------------------------

    /// Fetch an output row by its natural key.
    async fn get_output(&self, job_id: Id, path: &str) -> Result<Option<Output>, Error>;

    /// Upsert an output row: create if absent, otherwise update `metrics`,
    /// `record_count`, `project_key`, `repo_name`.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_output(
        &self,
        job_id: Id,
        path: &str,
        project_key: &str,
        repo_name: &str,
        metrics: Vec<String>,
        record_count: i64,
    ) -> Result<Output, Error>;

    // --- Backend admission ----------------------------------------------

    /// Attempt to acquire one admission slot for `instance` on behalf of
    /// `job_id`. Serializable against concurrent acquires.
    async fn try_acquire_admission(
        &self,
        instance: &str,
        max_concurrent: i64,
        job_id: Id,
        data_source_id: Id,
    ) -> Result<Admission, Error>;

    /// Release a previously-acquired admission slot.
    async fn release_admission(&self, instance: &str, job_id: Id) -> Result<(), Error>;

    /// Current admission state for `instance`.
    async fn admission_capacity(
        &self,
        instance: &str,
        max_concurrent: i64,
    ) -> Result<AdmissionCapacity, Error>;
}

/// Connect to the sqlite repository store implementation.
///
/// Note that this function returns [`sqlite::Database`], which is a private
/// type. The intention here is to allow _using_ the type, but not
/// _accepting_ the type: callers should accept `impl Database` or `&dyn
/// Database` instead.
pub async fn connect_sqlite(location: &Path) -> Result<sqlite::Database, Error> {
    sqlite::Database::connect(location)
        .await
        .change_context(Error::Initialize)
}
