use commit_scanner::{
    db::{connect_sqlite, Admission, Database, NewCommitTask},
    doc::{crate_name, crate_version},
    model::{DataSourceStatus, DeadLetterReason, DeadLetterStatus, JobStatus},
};
use semver::Version;
use sqlx::{query, Connection};
use tempfile::tempdir;

use crate::assert_error_stack_snapshot;

/// Open a temporary database.
macro_rules! temp_db {
    () => {{
        let tmp = tempdir().expect("must create temporary directory");
        let path = tmp.path().join("test.db");
        let db = connect_sqlite(&path).await.expect("must create db");
        (tmp, db, path)
    }};
}

/// Create a new raw db and a connection to it, used to set up state before
/// opening the real database interface at the same path.
macro_rules! raw_temp_db {
    (with_migrations) => {{
        let tmp = tempdir().expect("must create temporary directory");
        let path = tmp.path().join("test.db");
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let mut conn = sqlx::SqliteConnection::connect_with(&options)
            .await
            .expect("must create db");
        sqlx::migrate!("db/migrations")
            .run(&mut conn)
            .await
            .expect("must migrate db");
        (tmp, conn, path)
    }};
}

#[tokio::test]
async fn creates_if_not_exists() {
    let (_tmp, _db, _path) = temp_db!();
}

#[tokio::test]
async fn claims_current_version() {
    let (_tmp, db, _path) = temp_db!();

    db.claim_schema_version().await.expect("must claim current version");

    let version = db
        .schema_version()
        .await
        .expect("must get version")
        .expect("must have a version set");

    assert_eq!(&version, crate_version());
}

#[tokio::test]
async fn claim_older_version_fails() {
    let version = crate_version();
    let newer = Version::new(version.major + 1, version.minor, version.patch).to_string();

    // Need a bare connection since setting an arbitrary version is private.
    let (_tmp, mut conn, path) = raw_temp_db!(with_migrations);
    let name = crate_name();
    query!("insert into schema_version values (?, ?)", name, newer)
        .execute(&mut conn)
        .await
        .expect("must set initial schema version");
    conn.close().await.expect("must close db");

    let db = connect_sqlite(&path).await.expect("must connect to existing db");
    let err = db.claim_schema_version().await.expect_err("must fail to claim version");
    assert_error_stack_snapshot!(&path, err);
}

#[tokio::test]
async fn data_source_job_commit_task_roundtrip() {
    let (_tmp, db, _path) = temp_db!();

    let data_source = db
        .create_data_source("build-history.csv", "/data/build-history.csv", 2, None)
        .await
        .expect("must create data source");
    assert_eq!(data_source.status(), &DataSourceStatus::Pending);

    db.set_data_source_status(*data_source.id(), DataSourceStatus::Processing)
        .await
        .expect("must set data source status");
    let fetched = db
        .get_data_source(*data_source.id())
        .await
        .expect("must get data source")
        .expect("data source must exist");
    assert_eq!(fetched.status(), &DataSourceStatus::Processing);

    let job = db.create_job(*data_source.id(), 2).await.expect("must create job");
    assert_eq!(job.status(), &JobStatus::Queued);
    assert_eq!(*job.total(), 2);

    db.create_commit_task(NewCommitTask {
        project_key: String::from("proj"),
        commit_sha: String::from("abc123"),
        repo_url: String::from("https://example.com/proj.git"),
        repo_slug: String::from("org/proj"),
        config_override: None,
        job_id: *job.id(),
        data_source_id: *data_source.id(),
    })
    .await
    .expect("must create commit task");

    let task = db
        .get_commit_task("proj", "abc123")
        .await
        .expect("must get commit task")
        .expect("commit task must exist");
    assert_eq!(task.retry_count(), &0);

    db.claim_commit_task("proj", "abc123").await.expect("must claim commit task");
    let retries = db
        .increment_commit_task_retry("proj", "abc123")
        .await
        .expect("must increment retry count");
    assert_eq!(retries, 1);

    let job = db.increment_job_processed(*job.id()).await.expect("must increment processed");
    assert_eq!(*job.processed(), 1);
    assert!(!job.is_complete());

    let job = db.increment_job_failed(*job.id(), "scan failed").await.expect("must increment failed");
    assert_eq!(*job.failed_count(), 1);
    assert!(job.is_complete());
}

#[tokio::test]
async fn sonar_run_upsert_and_update() {
    let (_tmp, db, _path) = temp_db!();

    let data_source = db
        .create_data_source("ds", "/data/ds.csv", 1, None)
        .await
        .expect("must create data source");

    let run = db
        .upsert_sonar_run_running(*data_source.id(), "proj", "abc123", "proj_abc123", "default")
        .await
        .expect("must upsert sonar run");
    assert_eq!(run.component_key(), "proj_abc123");

    db.update_sonar_run(
        "proj_abc123",
        commit_scanner::model::SonarRunStatus::Succeeded,
        Some("analysis-1"),
        Some("log-ref"),
        Some("/export/proj_abc123.csv"),
        None,
    )
    .await
    .expect("must update sonar run");

    let updated = db
        .get_sonar_run_by_component_key("proj_abc123")
        .await
        .expect("must get sonar run")
        .expect("sonar run must exist");
    assert_eq!(updated.status(), &commit_scanner::model::SonarRunStatus::Succeeded);
    assert_eq!(updated.analysis_id().as_deref(), Some("analysis-1"));
}

#[tokio::test]
async fn dead_letter_lifecycle() {
    let (_tmp, db, _path) = temp_db!();

    let data_source = db.create_data_source("ds", "/data/ds.csv", 1, None).await.expect("must create data source");
    let job = db.create_job(*data_source.id(), 1).await.expect("must create job");
    let payload = commit_scanner::model::CommitTask::new(
        String::from("proj"),
        String::from("abc123"),
        String::from("https://example.com/proj.git"),
        String::from("org/proj"),
        None,
        *job.id(),
        *data_source.id(),
        0,
    );

    let dead_letter = db
        .insert_dead_letter(payload, DeadLetterReason::ScanFailed, None)
        .await
        .expect("must insert dead letter");
    assert_eq!(dead_letter.status(), &DeadLetterStatus::Pending);

    let pending = db
        .list_dead_letters(Some(DeadLetterStatus::Pending))
        .await
        .expect("must list pending dead letters");
    assert_eq!(pending.len(), 1);

    db.set_dead_letter_override(*dead_letter.id(), Some(serde_json::json!({"foo": "bar"})))
        .await
        .expect("must set dead letter override");
    db.set_dead_letter_status(*dead_letter.id(), DeadLetterStatus::Queued)
        .await
        .expect("must set dead letter status");

    let updated = db
        .get_dead_letter(*dead_letter.id())
        .await
        .expect("must get dead letter")
        .expect("dead letter must exist");
    assert_eq!(updated.status(), &DeadLetterStatus::Queued);
    assert_eq!(updated.config_override(), &Some(serde_json::json!({"foo": "bar"})));
}

#[tokio::test]
async fn admission_acquire_release_and_capacity() {
    let (_tmp, db, _path) = temp_db!();

    let data_source = db.create_data_source("ds", "/data/ds.csv", 1, None).await.expect("must create data source");
    let job = db.create_job(*data_source.id(), 1).await.expect("must create job");

    let first = db
        .try_acquire_admission("default", 1, *job.id(), *data_source.id())
        .await
        .expect("must attempt to acquire admission");
    assert_eq!(first, Admission::Acquired);

    let second_job = db.create_job(*data_source.id(), 1).await.expect("must create second job");
    let second = db
        .try_acquire_admission("default", 1, *second_job.id(), *data_source.id())
        .await
        .expect("must attempt to acquire admission");
    assert_eq!(second, Admission::Denied, "max_concurrent of 1 must deny a second concurrent acquire");

    let capacity = db.admission_capacity("default", 1).await.expect("must get admission capacity");
    assert_eq!(capacity.active, 1);
    assert_eq!(capacity.available(), 0);

    db.release_admission("default", *job.id()).await.expect("must release admission");
    let capacity = db.admission_capacity("default", 1).await.expect("must get admission capacity");
    assert_eq!(capacity.active, 0);
    assert_eq!(capacity.available(), 1);
}
