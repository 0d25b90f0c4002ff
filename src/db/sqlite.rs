//! Database implementation using sqlite as a backing store.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use derive_new::new;
use error_stack::{report, Result, ResultExt};
use indoc::indoc;
use semver::Version;
use sqlx::{
    migrate, query, query_as,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tap::TapFallible;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::{
    db::{Admission, AdmissionCapacity, NewCommitTask},
    doc::{crate_name, crate_version},
    ext::{
        error_stack::{DescribeContext, ErrorHelper},
        result::WrapErr,
    },
    model::{
        CommitTask, DataSource, DataSourceStatus, DeadLetter, DeadLetterReason, DeadLetterStatus,
        Id, Job, JobStatus, Output, SonarRun, SonarRunStatus,
    },
};

/// Errors interacting with sqlite.
#[derive(Debug, Error)]
pub enum Error {
    /// Encountered when connecting to the database.
    #[error("connect to database")]
    Connect,

    /// Encountered when migrating database state.
    #[error("migrate database")]
    Migrate,

    /// Encountered when parsing a DB value.
    #[error("parse value from DB")]
    Parse,

    /// Encountered with serializing a DB value.
    #[error("serialize value to DB")]
    Serialize,

    /// A general communication error.
    #[error("communication error with DB")]
    Communication,
}

fn format_rfc3339(at: OffsetDateTime) -> Result<String, Error> {
    at.format(&Rfc3339).context(Error::Serialize)
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::parse(raw, &Rfc3339).context(Error::Parse)
}

fn parse_uuid(raw: &str) -> Result<Id, Error> {
    Uuid::parse_str(raw).context(Error::Parse)
}

fn parse_enum<T>(raw: &str) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().context(Error::Parse)
}

fn encode_override(value: Option<&serde_json::Value>) -> Result<Option<String>, Error> {
    value.map(serde_json::to_string).transpose().context(Error::Serialize)
}

fn decode_override(raw: Option<String>) -> Result<Option<serde_json::Value>, Error> {
    raw.map(|raw| serde_json::from_str(&raw)).transpose().context(Error::Parse)
}

/// A database implemented with sqlite.
#[derive(new)]
pub struct Database {
    location: PathBuf,
    internal: SqlitePool,
}

impl Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .finish()
    }
}

impl Database {
    /// Connect to the database.
    #[tracing::instrument]
    pub async fn connect(location: &Path) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(location)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        debug!("open db at {location:?} with connect options: {options:?}");
        let db = SqlitePoolOptions::new()
            .max_connections(64)
            .min_connections(1)
            .connect_with(options)
            .await
            .context(Error::Connect)
            .describe_lazy(|| format!("attempted to open sqlite db at {location:?}"))?;

        Self::new(location.to_path_buf(), db).migrate().await
    }

    /// Migrate the database.
    #[tracing::instrument]
    async fn migrate(self) -> Result<Self, Error> {
        migrate!("db/migrations")
            .run(&self.internal)
            .await
            .context(Error::Migrate)
            .describe("migrations are compiled into this tool's binary")
            .help(indoc! {"
            This error likely means the database is corrupted.
            The database is only used to track in-flight scheduling state,
            deleting the database may recover this error (in-flight jobs would need to be re-ingested).
            "})
            .map(|_| self)
    }

    #[tracing::instrument]
    async fn update_schema_version(&self, version: &Version) -> Result<(), Error> {
        let name = crate_name();
        let version = version.to_string();
        query!(
            r#"
            insert into schema_version values (?, ?)
            on conflict do update set version = excluded.version
            "#,
            name,
            version
        )
        .execute(&self.internal)
        .await
        .map(|result| debug!("result: {result:?}"))
        .context(Error::Communication)
    }
}

struct SchemaVersionRow {
    version: String,
}

struct DataSourceRow {
    id: String,
    name: String,
    source_path: String,
    total_commits: i64,
    config_override: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl DataSourceRow {
    fn into_domain(self) -> Result<DataSource, Error> {
        Ok(DataSource::new(
            parse_uuid(&self.id)?,
            self.name,
            self.source_path,
            self.total_commits,
            decode_override(self.config_override)?,
            parse_enum::<DataSourceStatus>(&self.status)?,
            parse_rfc3339(&self.created_at)?,
            parse_rfc3339(&self.updated_at)?,
        ))
    }
}

struct JobRow {
    id: String,
    data_source_id: String,
    total: i64,
    processed: i64,
    failed_count: i64,
    status: String,
    current_commit: Option<String>,
    assigned_backend_instance: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_domain(self) -> Result<Job, Error> {
        Ok(Job::new(
            parse_uuid(&self.id)?,
            parse_uuid(&self.data_source_id)?,
            self.total,
            self.processed,
            self.failed_count,
            parse_enum::<JobStatus>(&self.status)?,
            self.current_commit,
            self.assigned_backend_instance,
            self.last_error,
            parse_rfc3339(&self.created_at)?,
            parse_rfc3339(&self.updated_at)?,
        ))
    }
}

struct CommitTaskRow {
    project_key: String,
    commit_sha: String,
    repo_url: String,
    repo_slug: String,
    config_override: Option<String>,
    job_id: String,
    data_source_id: String,
    retry_count: i64,
}

impl CommitTaskRow {
    fn into_domain(self) -> Result<CommitTask, Error> {
        Ok(CommitTask::new(
            self.project_key,
            self.commit_sha,
            self.repo_url,
            self.repo_slug,
            decode_override(self.config_override)?,
            parse_uuid(&self.job_id)?,
            parse_uuid(&self.data_source_id)?,
            self.retry_count,
        ))
    }
}

struct SonarRunRow {
    data_source_id: String,
    project_key: String,
    commit_sha: String,
    component_key: String,
    status: String,
    backend_instance: String,
    analysis_id: Option<String>,
    log_ref: Option<String>,
    metrics_path: Option<String>,
    message: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl SonarRunRow {
    fn into_domain(self) -> Result<SonarRun, Error> {
        Ok(SonarRun::new(
            parse_uuid(&self.data_source_id)?,
            self.project_key,
            self.commit_sha,
            self.component_key,
            parse_enum::<SonarRunStatus>(&self.status)?,
            self.backend_instance,
            self.analysis_id,
            self.log_ref,
            self.metrics_path,
            self.message,
            parse_rfc3339(&self.started_at)?,
            self.finished_at.map(|raw| parse_rfc3339(&raw)).transpose()?,
        ))
    }
}

struct DeadLetterRow {
    id: String,
    payload: String,
    reason: String,
    status: String,
    config_override: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DeadLetterRow {
    fn into_domain(self) -> Result<DeadLetter, Error> {
        let payload: CommitTask = serde_json::from_str(&self.payload).context(Error::Parse)?;
        Ok(DeadLetter::new(
            parse_uuid(&self.id)?,
            payload,
            parse_enum::<DeadLetterReason>(&self.reason)?,
            parse_enum::<DeadLetterStatus>(&self.status)?,
            decode_override(self.config_override)?,
            parse_rfc3339(&self.created_at)?,
            parse_rfc3339(&self.updated_at)?,
        ))
    }
}

struct OutputRow {
    job_id: String,
    path: String,
    project_key: String,
    repo_name: String,
    metrics: String,
    record_count: i64,
    created_at: String,
    updated_at: String,
}

impl OutputRow {
    fn into_domain(self) -> Result<Output, Error> {
        let metrics: Vec<String> = serde_json::from_str(&self.metrics).context(Error::Parse)?;
        Ok(Output::new(
            parse_uuid(&self.job_id)?,
            self.path,
            self.project_key,
            self.repo_name,
            metrics,
            self.record_count,
            parse_rfc3339(&self.created_at)?,
            parse_rfc3339(&self.updated_at)?,
        ))
    }
}

struct CountRow {
    count: i64,
}

struct JobIdRow {
    job_id: String,
}

#[async_trait]
impl super::Database for Database {
    #[tracing::instrument]
    async fn schema_version(&self) -> Result<Option<Version>, super::Error> {
        let name = crate_name();
        query_as!(SchemaVersionRow, "select version from schema_version where name = ?", name)
            .fetch_optional(&self.internal)
            .await
            .tap_ok(|raw| debug!("read: {raw:?}"))
            .context(Error::Communication)
            .change_context(super::Error::Interact)?
            .map(|row| Version::parse(&row.version))
            .transpose()
            .context(Error::Parse)
            .describe("schema versions must be valid semver")
            .help("this likely indicates that the database is corrupted, as every release of this tool writes a valid semver")
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument]
    async fn claim_schema_version(&self) -> Result<(), super::Error> {
        let current_version = crate_version().clone();
        let db_version = self.schema_version().await?;
        debug!("claiming version {current_version} against db {db_version:?}");

        match db_version {
            None => {
                debug!("db does not have a version set, inserting into db");
                self.update_schema_version(&current_version)
                    .await
                    .change_context(super::Error::Interact)
            }
            Some(db_version) if current_version < db_version => {
                debug!("current version is older than db version, bailing");
                report!(super::Error::SchemaOutdated)
                    .wrap_err()
                    .describe(indoc! {"
                        This database stores the last used version to ensure that older
                        versions of this tool cannot break invariants added by newer versions.
                        "})
                    .help("try again with the latest version of this tool")
            }
            Some(db_version) if current_version > db_version => {
                debug!("current version is newer than db version, updating db");
                self.update_schema_version(&current_version)
                    .await
                    .change_context(super::Error::Interact)
            }
            Some(_) => {
                debug!("versions were the same");
                Ok(())
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn create_data_source(
        &self,
        name: &str,
        source_path: &str,
        total_commits: i64,
        config_override: Option<serde_json::Value>,
    ) -> Result<DataSource, super::Error> {
        let id = Uuid::new_v4();
        let id_s = id.to_string();
        let now = OffsetDateTime::now_utc();
        let now_s = format_rfc3339(now).change_context(super::Error::Interact)?;
        let config_override_s = encode_override(config_override.as_ref()).change_context(super::Error::Interact)?;
        let status = DataSourceStatus::Pending.to_string();

        query!(
            r#"
            insert into data_source (id, name, source_path, total_commits, config_override, status, created_at, updated_at)
            values (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            id_s,
            name,
            source_path,
            total_commits,
            config_override_s,
            status,
            now_s,
            now_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        Ok(DataSource::new(
            id,
            name.to_string(),
            source_path.to_string(),
            total_commits,
            config_override,
            DataSourceStatus::Pending,
            now,
            now,
        ))
    }

    #[tracing::instrument(skip(self))]
    async fn get_data_source(&self, id: Id) -> Result<Option<DataSource>, super::Error> {
        let id_s = id.to_string();
        query_as!(DataSourceRow, "select * from data_source where id = ?", id_s)
            .fetch_optional(&self.internal)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?
            .map(DataSourceRow::into_domain)
            .transpose()
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn set_data_source_status(&self, id: Id, status: DataSourceStatus) -> Result<(), super::Error> {
        let id_s = id.to_string();
        let status = status.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        query!(
            "update data_source set status = ?, updated_at = ? where id = ?",
            status,
            now,
            id_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn create_job(&self, data_source_id: Id, total: i64) -> Result<Job, super::Error> {
        let id = Uuid::new_v4();
        let id_s = id.to_string();
        let data_source_id_s = data_source_id.to_string();
        let now = OffsetDateTime::now_utc();
        let now_s = format_rfc3339(now).change_context(super::Error::Interact)?;
        let status = JobStatus::Queued.to_string();

        query!(
            r#"
            insert into job (id, data_source_id, total, processed, failed_count, status, created_at, updated_at)
            values (?, ?, ?, 0, 0, ?, ?, ?)
            "#,
            id_s,
            data_source_id_s,
            total,
            status,
            now_s,
            now_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        Ok(Job::new(
            id,
            data_source_id,
            total,
            0,
            0,
            JobStatus::Queued,
            None,
            None,
            None,
            now,
            now,
        ))
    }

    #[tracing::instrument(skip(self))]
    async fn get_job(&self, id: Id) -> Result<Option<Job>, super::Error> {
        let id_s = id.to_string();
        query_as!(JobRow, "select * from job where id = ?", id_s)
            .fetch_optional(&self.internal)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?
            .map(JobRow::into_domain)
            .transpose()
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn increment_job_processed(&self, id: Id) -> Result<Job, super::Error> {
        let id_s = id.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        let running = JobStatus::Running.to_string();
        let queued = JobStatus::Queued.to_string();

        let mut tx = self
            .internal
            .begin()
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        query!(
            r#"
            update job set processed = processed + 1, updated_at = ?,
                status = case when status = ? then ? else status end
            where id = ?
            "#,
            now,
            queued,
            running,
            id_s
        )
        .execute(&mut *tx)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        let row = query_as!(JobRow, "select * from job where id = ?", id_s)
            .fetch_one(&mut *tx)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        tx.commit()
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        row.into_domain().change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn increment_job_failed(&self, id: Id, last_error: &str) -> Result<Job, super::Error> {
        let id_s = id.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        let running = JobStatus::Running.to_string();
        let queued = JobStatus::Queued.to_string();

        let mut tx = self
            .internal
            .begin()
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        query!(
            r#"
            update job set failed_count = failed_count + 1, last_error = ?, updated_at = ?,
                status = case when status = ? then ? else status end
            where id = ?
            "#,
            last_error,
            now,
            queued,
            running,
            id_s
        )
        .execute(&mut *tx)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        let row = query_as!(JobRow, "select * from job where id = ?", id_s)
            .fetch_one(&mut *tx)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        tx.commit()
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        row.into_domain().change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn set_job_status(&self, id: Id, status: JobStatus) -> Result<(), super::Error> {
        let id_s = id.to_string();
        let status = status.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        query!(
            "update job set status = ?, updated_at = ? where id = ?",
            status,
            now,
            id_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn set_job_progress_markers(
        &self,
        id: Id,
        current_commit: Option<&str>,
        assigned_backend_instance: Option<&str>,
    ) -> Result<(), super::Error> {
        let id_s = id.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        query!(
            "update job set current_commit = ?, assigned_backend_instance = ?, updated_at = ? where id = ?",
            current_commit,
            assigned_backend_instance,
            now,
            id_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self, task))]
    async fn create_commit_task(&self, task: NewCommitTask) -> Result<(), super::Error> {
        let job_id_s = task.job_id.to_string();
        let data_source_id_s = task.data_source_id.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        let config_override_s =
            encode_override(task.config_override.as_ref()).change_context(super::Error::Interact)?;

        query!(
            r#"
            insert into commit_task
                (project_key, commit_sha, repo_url, repo_slug, config_override, job_id, data_source_id, retry_count, enqueued_at)
            values (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
            task.project_key,
            task.commit_sha,
            task.repo_url,
            task.repo_slug,
            config_override_s,
            job_id_s,
            data_source_id_s,
            now
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn get_commit_task(
        &self,
        project_key: &str,
        commit_sha: &str,
    ) -> Result<Option<CommitTask>, super::Error> {
        query_as!(
            CommitTaskRow,
            "select project_key, commit_sha, repo_url, repo_slug, config_override, job_id, data_source_id, retry_count \
             from commit_task where project_key = ? and commit_sha = ?",
            project_key,
            commit_sha
        )
        .fetch_optional(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?
        .map(CommitTaskRow::into_domain)
        .transpose()
        .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_commit_task(&self, project_key: &str, commit_sha: &str) -> Result<(), super::Error> {
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        query!(
            "update commit_task set claimed_at = ? where project_key = ? and commit_sha = ?",
            now,
            project_key,
            commit_sha
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn increment_commit_task_retry(
        &self,
        project_key: &str,
        commit_sha: &str,
    ) -> Result<i64, super::Error> {
        query!(
            "update commit_task set retry_count = retry_count + 1 where project_key = ? and commit_sha = ?",
            project_key,
            commit_sha
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        let row = query_as!(
            CommitTaskRow,
            "select project_key, commit_sha, repo_url, repo_slug, config_override, job_id, data_source_id, retry_count \
             from commit_task where project_key = ? and commit_sha = ?",
            project_key,
            commit_sha
        )
        .fetch_one(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        Ok(row.retry_count)
    }

    #[tracing::instrument(skip(self))]
    async fn stale_claimed_commit_tasks(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<CommitTask>, super::Error> {
        let older_than_s = format_rfc3339(older_than).change_context(super::Error::Interact)?;
        query_as!(
            CommitTaskRow,
            "select project_key, commit_sha, repo_url, repo_slug, config_override, job_id, data_source_id, retry_count \
             from commit_task where claimed_at is not null and claimed_at < ?",
            older_than_s
        )
        .fetch_all(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?
        .into_iter()
        .map(CommitTaskRow::into_domain)
        .collect::<Result<Vec<_>, _>>()
        .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn unclaim_commit_task(&self, project_key: &str, commit_sha: &str) -> Result<(), super::Error> {
        query!(
            "update commit_task set claimed_at = null where project_key = ? and commit_sha = ?",
            project_key,
            commit_sha
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn upsert_sonar_run_running(
        &self,
        data_source_id: Id,
        project_key: &str,
        commit_sha: &str,
        component_key: &str,
        backend_instance: &str,
    ) -> Result<SonarRun, super::Error> {
        let data_source_id_s = data_source_id.to_string();
        let now = OffsetDateTime::now_utc();
        let now_s = format_rfc3339(now).change_context(super::Error::Interact)?;
        let status = SonarRunStatus::Running.to_string();

        query!(
            r#"
            insert into sonar_run
                (data_source_id, project_key, commit_sha, component_key, status, backend_instance, started_at)
            values (?, ?, ?, ?, ?, ?, ?)
            on conflict (data_source_id, project_key, commit_sha) do update set
                component_key = excluded.component_key,
                status = excluded.status,
                backend_instance = excluded.backend_instance,
                started_at = excluded.started_at,
                analysis_id = null,
                log_ref = null,
                metrics_path = null,
                message = null,
                finished_at = null
            "#,
            data_source_id_s,
            project_key,
            commit_sha,
            component_key,
            status,
            backend_instance,
            now_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        Ok(SonarRun::new(
            data_source_id,
            project_key.to_string(),
            commit_sha.to_string(),
            component_key.to_string(),
            SonarRunStatus::Running,
            backend_instance.to_string(),
            None,
            None,
            None,
            None,
            now,
            None,
        ))
    }

    #[tracing::instrument(skip(self))]
    async fn get_sonar_run_by_component_key(
        &self,
        component_key: &str,
    ) -> Result<Option<SonarRun>, super::Error> {
        query_as!(SonarRunRow, "select * from sonar_run where component_key = ?", component_key)
            .fetch_optional(&self.internal)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?
            .map(SonarRunRow::into_domain)
            .transpose()
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn update_sonar_run(
        &self,
        component_key: &str,
        status: SonarRunStatus,
        analysis_id: Option<&str>,
        log_ref: Option<&str>,
        metrics_path: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), super::Error> {
        let status_s = status.to_string();
        let finished_at = if status.is_terminal() {
            Some(format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?)
        } else {
            None
        };

        query!(
            r#"
            update sonar_run set
                status = ?,
                analysis_id = coalesce(?, analysis_id),
                log_ref = coalesce(?, log_ref),
                metrics_path = coalesce(?, metrics_path),
                message = coalesce(?, message),
                finished_at = coalesce(?, finished_at)
            where component_key = ?
            "#,
            status_s,
            analysis_id,
            log_ref,
            metrics_path,
            message,
            finished_at,
            component_key
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn stale_running_sonar_runs(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<SonarRun>, super::Error> {
        let older_than_s = format_rfc3339(older_than).change_context(super::Error::Interact)?;
        let running = SonarRunStatus::Running.to_string();
        query_as!(
            SonarRunRow,
            "select * from sonar_run where status = ? and started_at < ?",
            running,
            older_than_s
        )
        .fetch_all(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?
        .into_iter()
        .map(SonarRunRow::into_domain)
        .collect::<Result<Vec<_>, _>>()
        .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self, payload))]
    async fn insert_dead_letter(
        &self,
        payload: CommitTask,
        reason: DeadLetterReason,
        config_override: Option<serde_json::Value>,
    ) -> Result<DeadLetter, super::Error> {
        let id = Uuid::new_v4();
        let id_s = id.to_string();
        let now = OffsetDateTime::now_utc();
        let now_s = format_rfc3339(now).change_context(super::Error::Interact)?;
        let payload_s = serde_json::to_string(&payload)
            .context(Error::Serialize)
            .change_context(super::Error::Interact)?;
        let reason_s = reason.to_string();
        let status = DeadLetterStatus::Pending.to_string();
        let config_override_s = encode_override(config_override.as_ref()).change_context(super::Error::Interact)?;

        query!(
            r#"
            insert into dead_letter (id, payload, reason, status, config_override, created_at, updated_at)
            values (?, ?, ?, ?, ?, ?, ?)
            "#,
            id_s,
            payload_s,
            reason_s,
            status,
            config_override_s,
            now_s,
            now_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        Ok(DeadLetter::new(
            id,
            payload,
            reason,
            DeadLetterStatus::Pending,
            config_override,
            now,
            now,
        ))
    }

    #[tracing::instrument(skip(self))]
    async fn get_dead_letter(&self, id: Id) -> Result<Option<DeadLetter>, super::Error> {
        let id_s = id.to_string();
        query_as!(DeadLetterRow, "select * from dead_letter where id = ?", id_s)
            .fetch_optional(&self.internal)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?
            .map(DeadLetterRow::into_domain)
            .transpose()
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, super::Error> {
        let rows = match status {
            Some(status) => {
                let status = status.to_string();
                query_as!(DeadLetterRow, "select * from dead_letter where status = ?", status)
                    .fetch_all(&self.internal)
                    .await
            }
            None => {
                query_as!(DeadLetterRow, "select * from dead_letter")
                    .fetch_all(&self.internal)
                    .await
            }
        };

        rows.context(Error::Communication)
            .change_context(super::Error::Interact)?
            .into_iter()
            .map(DeadLetterRow::into_domain)
            .collect::<Result<Vec<_>, _>>()
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn set_dead_letter_status(&self, id: Id, status: DeadLetterStatus) -> Result<(), super::Error> {
        let id_s = id.to_string();
        let status = status.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        query!(
            "update dead_letter set status = ?, updated_at = ? where id = ?",
            status,
            now,
            id_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn set_dead_letter_override(&self, id: Id, config_override: Option<serde_json::Value>) -> Result<(), super::Error> {
        let id_s = id.to_string();
        let config_override_s = encode_override(config_override.as_ref()).change_context(super::Error::Interact)?;
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;
        query!(
            "update dead_letter set config_override = ?, updated_at = ? where id = ?",
            config_override_s,
            now,
            id_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn get_output(&self, job_id: Id, path: &str) -> Result<Option<Output>, super::Error> {
        let job_id_s = job_id.to_string();
        query_as!(OutputRow, "select * from output where job_id = ? and path = ?", job_id_s, path)
            .fetch_optional(&self.internal)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?
            .map(OutputRow::into_domain)
            .transpose()
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self, metrics))]
    async fn upsert_output(
        &self,
        job_id: Id,
        path: &str,
        project_key: &str,
        repo_name: &str,
        metrics: Vec<String>,
        record_count: i64,
    ) -> Result<Output, super::Error> {
        let job_id_s = job_id.to_string();
        let now = OffsetDateTime::now_utc();
        let now_s = format_rfc3339(now).change_context(super::Error::Interact)?;
        let metrics_s = serde_json::to_string(&metrics)
            .context(Error::Serialize)
            .change_context(super::Error::Interact)?;

        query!(
            r#"
            insert into output (job_id, path, project_key, repo_name, metrics, record_count, created_at, updated_at)
            values (?, ?, ?, ?, ?, ?, ?, ?)
            on conflict (job_id, path) do update set
                project_key = excluded.project_key,
                repo_name = excluded.repo_name,
                metrics = excluded.metrics,
                record_count = excluded.record_count,
                updated_at = excluded.updated_at
            "#,
            job_id_s,
            path,
            project_key,
            repo_name,
            metrics_s,
            record_count,
            now_s,
            now_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        query_as!(OutputRow, "select * from output where job_id = ? and path = ?", job_id_s, path)
            .fetch_one(&self.internal)
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?
            .into_domain()
            .change_context(super::Error::Interact)
    }

    #[tracing::instrument(skip(self))]
    async fn try_acquire_admission(
        &self,
        instance: &str,
        max_concurrent: i64,
        job_id: Id,
        data_source_id: Id,
    ) -> Result<Admission, super::Error> {
        let job_id_s = job_id.to_string();
        let data_source_id_s = data_source_id.to_string();
        let now = format_rfc3339(OffsetDateTime::now_utc()).change_context(super::Error::Interact)?;

        let mut tx = self
            .internal
            .begin()
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        let CountRow { count } = query_as!(
            CountRow,
            "select count(*) as count from backend_admission where instance = ?",
            instance
        )
        .fetch_one(&mut *tx)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        if count >= max_concurrent {
            tx.rollback()
                .await
                .context(Error::Communication)
                .change_context(super::Error::Interact)?;
            return Ok(Admission::Denied);
        }

        query!(
            r#"
            insert into backend_admission (instance, job_id, data_source_id, acquired_at)
            values (?, ?, ?, ?)
            on conflict (instance, job_id) do nothing
            "#,
            instance,
            job_id_s,
            data_source_id_s,
            now
        )
        .execute(&mut *tx)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        tx.commit()
            .await
            .context(Error::Communication)
            .change_context(super::Error::Interact)?;

        Ok(Admission::Acquired)
    }

    #[tracing::instrument(skip(self))]
    async fn release_admission(&self, instance: &str, job_id: Id) -> Result<(), super::Error> {
        let job_id_s = job_id.to_string();
        query!(
            "delete from backend_admission where instance = ? and job_id = ?",
            instance,
            job_id_s
        )
        .execute(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)
        .map(|result| debug!("result: {result:?}"))
    }

    #[tracing::instrument(skip(self))]
    async fn admission_capacity(
        &self,
        instance: &str,
        max_concurrent: i64,
    ) -> Result<AdmissionCapacity, super::Error> {
        let rows = query_as!(
            JobIdRow,
            "select job_id from backend_admission where instance = ?",
            instance
        )
        .fetch_all(&self.internal)
        .await
        .context(Error::Communication)
        .change_context(super::Error::Interact)?;

        let job_ids = rows
            .into_iter()
            .map(|row| parse_uuid(&row.job_id))
            .collect::<Result<Vec<_>, _>>()
            .change_context(super::Error::Interact)?;

        Ok(AdmissionCapacity {
            active: job_ids.len() as i64,
            max: max_concurrent,
            job_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database as _;

    use tempfile::tempdir;

    use super::*;

    macro_rules! temp_db {
        () => {{
            let tmp = tempdir().expect("must create temporary directory");
            let db = super::Database::connect(&tmp.path().join("test.db"))
                .await
                .expect("must create db");
            (tmp, db)
        }};
    }

    #[tokio::test]
    async fn inserts_and_claims_schema_version() {
        let (_tmp, db) = temp_db!();

        assert!(db.schema_version().await.expect("must read version").is_none());
        db.claim_schema_version().await.expect("must claim version");

        let version = db.schema_version().await.expect("must read version");
        assert_eq!(version, Some(crate_version().clone()));
    }

    #[tokio::test]
    async fn data_source_lifecycle() {
        let (_tmp, db) = temp_db!();

        let created = db
            .create_data_source("widgets", "widgets.csv", 3, None)
            .await
            .expect("must create data source");
        assert_eq!(*created.status(), DataSourceStatus::Pending);

        db.set_data_source_status(*created.id(), DataSourceStatus::Ready)
            .await
            .expect("must update status");

        let fetched = db
            .get_data_source(*created.id())
            .await
            .expect("must fetch")
            .expect("must exist");
        assert_eq!(*fetched.status(), DataSourceStatus::Ready);
    }

    #[tokio::test]
    async fn job_progress_increments_are_atomic_and_transition_to_running() {
        let (_tmp, db) = temp_db!();
        let source = db.create_data_source("widgets", "widgets.csv", 2, None).await.unwrap();
        let job = db.create_job(*source.id(), 2).await.unwrap();
        assert_eq!(*job.status(), JobStatus::Queued);

        let updated = db.increment_job_processed(*job.id()).await.unwrap();
        assert_eq!(*updated.processed(), 1);
        assert_eq!(*updated.status(), JobStatus::Running);
        assert!(!updated.is_complete());

        let updated = db.increment_job_processed(*job.id()).await.unwrap();
        assert_eq!(*updated.processed(), 2);
        assert!(updated.is_complete());
    }

    #[tokio::test]
    async fn commit_task_round_trip_and_retry_counter() {
        let (_tmp, db) = temp_db!();
        let source = db.create_data_source("widgets", "widgets.csv", 1, None).await.unwrap();
        let job = db.create_job(*source.id(), 1).await.unwrap();

        db.create_commit_task(NewCommitTask {
            project_key: "acme/widgets".into(),
            commit_sha: "deadbeef".into(),
            repo_url: "https://example.com/acme/widgets.git".into(),
            repo_slug: "acme/widgets".into(),
            config_override: None,
            job_id: *job.id(),
            data_source_id: *source.id(),
        })
        .await
        .expect("must create commit task");

        let task = db
            .get_commit_task("acme/widgets", "deadbeef")
            .await
            .expect("must fetch")
            .expect("must exist");
        assert_eq!(*task.retry_count(), 0);

        let retries = db
            .increment_commit_task_retry("acme/widgets", "deadbeef")
            .await
            .expect("must increment");
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn admission_is_bounded_by_max_concurrent() {
        let (_tmp, db) = temp_db!();
        let source = db.create_data_source("widgets", "widgets.csv", 2, None).await.unwrap();
        let job_a = db.create_job(*source.id(), 1).await.unwrap();
        let job_b = db.create_job(*source.id(), 1).await.unwrap();

        let first = db
            .try_acquire_admission("sonar-1", 1, *job_a.id(), *source.id())
            .await
            .unwrap();
        assert_eq!(first, Admission::Acquired);

        let second = db
            .try_acquire_admission("sonar-1", 1, *job_b.id(), *source.id())
            .await
            .unwrap();
        assert_eq!(second, Admission::Denied);

        db.release_admission("sonar-1", *job_a.id()).await.unwrap();

        let third = db
            .try_acquire_admission("sonar-1", 1, *job_b.id(), *source.id())
            .await
            .unwrap();
        assert_eq!(third, Admission::Acquired);
    }

    #[tokio::test]
    async fn dead_letter_round_trip() {
        let (_tmp, db) = temp_db!();
        let source = db.create_data_source("widgets", "widgets.csv", 1, None).await.unwrap();
        let job = db.create_job(*source.id(), 1).await.unwrap();

        let payload = CommitTask::new(
            "acme/widgets".into(),
            "deadbeef".into(),
            "https://example.com/acme/widgets.git".into(),
            "acme/widgets".into(),
            None,
            *job.id(),
            *source.id(),
            3,
        );

        let letter = db
            .insert_dead_letter(payload, DeadLetterReason::ScanFailed, None)
            .await
            .expect("must insert dead letter");
        assert_eq!(*letter.status(), DeadLetterStatus::Pending);

        let pending = db
            .list_dead_letters(Some(DeadLetterStatus::Pending))
            .await
            .expect("must list");
        assert_eq!(pending.len(), 1);

        db.set_dead_letter_status(*letter.id(), DeadLetterStatus::Resolved)
            .await
            .expect("must update status");
        let pending = db
            .list_dead_letters(Some(DeadLetterStatus::Pending))
            .await
            .expect("must list");
        assert!(pending.is_empty());
    }
}
