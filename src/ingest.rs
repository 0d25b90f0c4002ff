//! Fans an uploaded build-history CSV out into a `Job` and its per-commit
//! `CommitTask`s. CSV parsing is explicitly not the hard part of this
//! pipeline, so the parser here is hand-rolled rather than reaching for a
//! `csv` crate, the same call `crate::exporter` makes for its own CSV
//! writing (see `DESIGN.md`).
//!
//! Runs as a worker loop over the `Queue::Ingest` tier: each envelope names
//! one pending `DataSource`, whose `source_path` is read from disk and
//! streamed line-by-line so this doesn't hold an entire dataset in memory.

use std::path::Path;

use error_stack::{IntoReport, Result, ResultExt};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::Mutex,
};
use tracing::{info, warn};

use crate::{
    db::Database,
    executor,
    ext::error_stack::DescribeContext,
    model::{CommitTask, DataSourceStatus, Id},
    queue::{Priority, Sender},
};

/// Errors encountered ingesting a data source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The repository store rejected a query or upsert.
    #[error("query or update repository store")]
    Persist,

    /// The named data source doesn't exist.
    #[error("data source not found")]
    NotFound,

    /// Reading the source CSV from disk failed.
    #[error("read source CSV")]
    ReadSource,

    /// A row was structurally invalid (wrong column count, empty required
    /// field).
    #[error("malformed CSV row")]
    MalformedRow,

    /// Enqueuing a newly-created commit task onto the scan queue failed.
    #[error("enqueue commit task")]
    Enqueue,
}

/// A queue payload requesting ingestion of one uploaded data source.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestJob {
    /// The `DataSource` to ingest.
    pub data_source_id: Id,
}

/// One parsed row of the build-history CSV: a single commit of a single
/// project to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Row {
    project_key: String,
    commit_sha: String,
    repo_url: String,
    repo_slug: String,
}

/// Expected header, in order. Any other header is rejected rather than
/// silently reordered, since a transposed `repo_url`/`repo_slug` column
/// would otherwise fail far downstream at checkout time instead of here.
const HEADER: [&str; 4] = ["project_key", "commit_sha", "repo_url", "repo_slug"];

/// Parse one non-header CSV line into a [`Row`].
///
/// No quoting or embedded-comma support: build-history exports are expected
/// to carry plain slugs and URLs, not free text, so a naive `split(',')` is
/// sufficient (see `DESIGN.md`'s note on the exporter's equally minimal CSV
/// handling).
fn parse_row(line: &str) -> Result<Row, Error> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != HEADER.len() {
        return Err(Error::MalformedRow)
            .into_report()
            .describe_lazy(|| format!("expected {} columns, got {}: '{line}'", HEADER.len(), fields.len()));
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(Error::MalformedRow)
            .into_report()
            .describe_lazy(|| format!("row has an empty required field: '{line}'"));
    }
    Ok(Row {
        project_key: fields[0].to_string(),
        commit_sha: fields[1].to_string(),
        repo_url: fields[2].to_string(),
        repo_slug: fields[3].to_string(),
    })
}

/// Read every row of the CSV at `path`, skipping (and warning on) any line
/// that fails to parse rather than failing the whole ingestion, since a
/// single malformed row in an otherwise-large build history shouldn't sink
/// the rest of it.
async fn read_rows(path: &Path) -> Result<Vec<Row>, Error> {
    let file = tokio::fs::File::open(path)
        .await
        .into_report()
        .change_context(Error::ReadSource)
        .describe_lazy(|| format!("open source CSV at '{}'", path.display()))?;

    let mut lines = BufReader::new(file).lines();
    let mut rows = Vec::new();
    let mut seen_header = false;

    while let Some(line) = lines
        .next_line()
        .await
        .into_report()
        .change_context(Error::ReadSource)?
    {
        if line.trim().is_empty() {
            continue;
        }
        if !seen_header {
            // The header row itself is consumed, not validated against
            // `HEADER` byte-for-byte: operators may export with different
            // casing or spacing, and the column *order* is what this parser
            // actually depends on.
            seen_header = true;
            continue;
        }
        match parse_row(&line) {
            Ok(row) => rows.push(row),
            Err(report) => warn!(error = ?report, "skipping malformed CSV row"),
        }
    }

    Ok(rows)
}

/// Ingest one pending `DataSource`: parse its source CSV, create a `Job`
/// sized to the row count, and persist one `CommitTask` per row.
///
/// Idempotent to the extent the underlying store is: re-running ingestion
/// for a `DataSource` that's already `processing` or past it re-parses the
/// CSV and re-attempts to create the same `CommitTask`s, which the store's
/// natural-key uniqueness on `(project_key, commit_sha)` is expected to
/// reject or ignore rather than duplicate (see `db/sqlite.rs`).
#[tracing::instrument(skip(db, scan_sender), fields(data_source_id = %job.data_source_id))]
pub async fn ingest<D: Database>(
    db: &D,
    scan_sender: &Mutex<Sender<CommitTask>>,
    job: &IngestJob,
) -> Result<(), Error> {
    let source = db
        .get_data_source(job.data_source_id)
        .await
        .change_context(Error::Persist)?
        .ok_or(Error::NotFound)
        .into_report()
        .describe_lazy(|| format!("data source '{}' does not exist", job.data_source_id))?;

    db.set_data_source_status(job.data_source_id, DataSourceStatus::Processing)
        .await
        .change_context(Error::Persist)?;

    let rows = read_rows(Path::new(source.source_path())).await?;
    if rows.is_empty() {
        db.set_data_source_status(job.data_source_id, DataSourceStatus::Failed)
            .await
            .change_context(Error::Persist)?;
        return Err(Error::MalformedRow)
            .into_report()
            .describe_lazy(|| format!("data source '{}' CSV had no usable rows", job.data_source_id));
    }

    let created = db
        .create_job(job.data_source_id, rows.len() as i64)
        .await
        .change_context(Error::Persist)?;

    for row in &rows {
        let new_task = executor::new_commit_task(
            row.project_key.clone(),
            row.commit_sha.clone(),
            row.repo_url.clone(),
            row.repo_slug.clone(),
            source.config_override().clone(),
            *created.id(),
            job.data_source_id,
        );
        db.create_commit_task(new_task.clone()).await.change_context(Error::Persist)?;

        let task = CommitTask::new(
            new_task.project_key,
            new_task.commit_sha,
            new_task.repo_url,
            new_task.repo_slug,
            new_task.config_override,
            new_task.job_id,
            new_task.data_source_id,
            0,
        );
        scan_sender
            .lock()
            .await
            .send(task, Priority::Normal)
            .await
            .change_context(Error::Enqueue)
            .describe_lazy(|| format!("enqueue commit task for job '{}'", created.id()))?;
    }

    info!(rows = rows.len(), job_id = %created.id(), "ingested data source");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::db::connect_sqlite;

    #[test]
    fn parse_row_rejects_wrong_column_count() {
        assert!(parse_row("a,b,c").is_err());
    }

    #[test]
    fn parse_row_rejects_empty_field() {
        assert!(parse_row("proj,,url,slug").is_err());
    }

    #[test]
    fn parse_row_accepts_well_formed_row() {
        let row = parse_row("owner/repo,deadbeef,https://example.com/owner/repo.git,owner/repo").expect("must parse");
        assert_eq!(row.project_key, "owner/repo");
        assert_eq!(row.commit_sha, "deadbeef");
    }

    #[tokio::test]
    async fn ingest_creates_one_task_per_row() {
        let dir = tempdir().expect("tempdir");
        let db = connect_sqlite(&dir.path().join("db.sqlite")).await.expect("connect");

        let csv_path = dir.path().join("history.csv");
        tokio::fs::write(
            &csv_path,
            "project_key,commit_sha,repo_url,repo_slug\nowner/repo,aaa,https://example.com/owner/repo.git,owner/repo\nowner/repo,bbb,https://example.com/owner/repo.git,owner/repo\n",
        )
        .await
        .expect("write csv");

        let source = db
            .create_data_source("history", csv_path.to_str().expect("utf8 path"), 0, None)
            .await
            .expect("create data source");

        let ctx = crate::AppContext::new(dir.path().to_path_buf());
        let (tx, mut rx) = crate::queue::open::<CommitTask>(&ctx, crate::queue::Queue::Scan)
            .await
            .expect("open queue");
        let tx = Mutex::new(tx);

        ingest(&db, &tx, &IngestJob { data_source_id: *source.id() })
            .await
            .expect("ingest");

        let updated = db.get_data_source(*source.id()).await.expect("query").expect("exists");
        assert_eq!(*updated.status(), DataSourceStatus::Processing);

        let first = db.get_commit_task("owner/repo", "aaa").await.expect("query").expect("exists");
        let second = db.get_commit_task("owner/repo", "bbb").await.expect("query").expect("exists");
        assert_eq!(*first.job_id(), *second.job_id());

        let job = db.get_job(*first.job_id()).await.expect("query").expect("exists");
        assert_eq!(*job.total(), 2);

        for _ in 0..2 {
            let guard = rx.recv().await.expect("must receive enqueued task");
            guard.commit().expect("commit");
        }
    }

    #[tokio::test]
    async fn ingest_fails_data_source_on_empty_csv() {
        let dir = tempdir().expect("tempdir");
        let db = connect_sqlite(&dir.path().join("db.sqlite")).await.expect("connect");

        let csv_path = dir.path().join("history.csv");
        tokio::fs::write(&csv_path, "project_key,commit_sha,repo_url,repo_slug\n")
            .await
            .expect("write csv");

        let source = db
            .create_data_source("empty", csv_path.to_str().expect("utf8 path"), 0, None)
            .await
            .expect("create data source");

        let ctx = crate::AppContext::new(dir.path().to_path_buf());
        let (tx, _rx) = crate::queue::open::<CommitTask>(&ctx, crate::queue::Queue::Scan)
            .await
            .expect("open queue");
        let tx = Mutex::new(tx);

        let result = ingest(&db, &tx, &IngestJob { data_source_id: *source.id() }).await;
        assert!(result.is_err());

        let updated = db.get_data_source(*source.id()).await.expect("query").expect("exists");
        assert_eq!(*updated.status(), DataSourceStatus::Failed);
    }
}
