//! The metrics exporter: resolves a `SonarRun` by component key, fetches
//! measures from the analysis backend in chunks, and appends one row to the
//! project's per-job output CSV under an exclusive file lock.
//!
//! CSV writing is hand-rolled rather than reaching for a `csv` crate: no
//! example in the corpus declares one, and appending a handful of numeric
//! columns to a file isn't worth the dependency (see `DESIGN.md`). The
//! exclusive file lock reuses `fs2`, the same advisory-locking primitive
//! [`crate::worktree`] uses for the per-repo lock.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use error_stack::{IntoReport, Result, ResultExt};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    backend,
    config::{BackendInstance, MetricsConfig},
    db::Database,
    ext::error_stack::DescribeContext,
    model::{Id, SonarRunStatus},
};

/// A queue payload requesting export of one component's measures, carrying
/// the correlation fields the webhook receiver attaches when it enqueues
/// this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    /// The component key to export measures for.
    pub component_key: String,
    /// The job this export belongs to, for output-path scoping.
    pub job_id: Id,
    /// The data source this export belongs to, if known.
    pub data_source_id: Option<Id>,
    /// The backend-reported analysis id, if the export was triggered by a
    /// webhook rather than the idempotency-skip path.
    pub analysis_id: Option<String>,
}

impl ExportJob {
    /// Build an export job for the idempotency-skip path, which has no
    /// analysis id since no scan (and so no webhook) ran.
    pub fn skipped(component_key: impl Into<String>, job_id: Id, data_source_id: Id) -> Self {
        Self {
            component_key: component_key.into(),
            job_id,
            data_source_id: Some(data_source_id),
            analysis_id: None,
        }
    }

    /// Build an export job correlated to a webhook callback.
    pub fn from_webhook(component_key: impl Into<String>, job_id: Id, data_source_id: Option<Id>, analysis_id: Option<String>) -> Self {
        Self {
            component_key: component_key.into(),
            job_id,
            data_source_id,
            analysis_id,
        }
    }
}

/// Errors encountered exporting metrics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The repository store rejected a query or upsert.
    #[error("query or update repository store")]
    Persist,

    /// The export job's component key has no tracked `SonarRun`.
    #[error("component is not tracked")]
    NotFound,

    /// The `SonarRun`'s backend instance is no longer present in config.
    #[error("backend instance is no longer configured")]
    UnknownBackend,

    /// Building the backend HTTP client failed.
    #[error("build analysis backend client")]
    BuildClient,

    /// Fetching measures from the analysis backend failed.
    #[error("fetch measures from analysis backend")]
    FetchMeasures,

    /// The backend returned no measures at all for this component.
    #[error("analysis backend returned no measures")]
    EmptyMeasures,

    /// Reading or writing the output CSV file failed.
    #[error("read or write output file")]
    FileIO,
}

impl Error {
    /// Whether this failure should count toward the export retry limit, as
    /// opposed to a permanent misconfiguration the caller shouldn't retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound | Self::UnknownBackend)
    }
}

/// Resolves a backend instance by name, as looked up from config. A plain
/// closure rather than a `&Config` reference so this module doesn't need to
/// know `Config`'s full shape, only how to look up one backend by name.
pub type BackendLookup<'a> = &'a dyn Fn(&str) -> Option<BackendInstance>;

/// Export measures for one component, appending a row to its project's
/// output CSV and updating the owning `SonarRun` and `Output` rows.
#[tracing::instrument(skip(db, backend_for, metrics), fields(component_key = %job.component_key))]
pub async fn export<D: Database>(
    db: &D,
    backend_for: BackendLookup<'_>,
    metrics: &MetricsConfig,
    export_root: &Path,
    job: &ExportJob,
) -> Result<(), Error> {
    let run = db
        .get_sonar_run_by_component_key(&job.component_key)
        .await
        .change_context(Error::Persist)?
        .ok_or(Error::NotFound)
        .into_report()
        .describe_lazy(|| format!("component '{}' has no tracked SonarRun", job.component_key))?;

    let instance = backend_for(run.backend_instance())
        .ok_or(Error::UnknownBackend)
        .into_report()
        .describe_lazy(|| format!("backend instance '{}' is no longer configured", run.backend_instance()))?;
    let client = backend::Client::new(&instance).change_context(Error::BuildClient)?;

    let mut fetched_values: HashMap<String, String> = HashMap::new();
    for chunk in metrics.measure_keys().chunks(metrics.chunk_size().max(1) as usize) {
        let components = [job.component_key.clone()];
        let result = client
            .fetch_measures(&components, chunk)
            .await
            .change_context(Error::FetchMeasures)?;
        if let Some(values) = result.get(&job.component_key) {
            fetched_values.extend(values.clone());
        }
    }

    if fetched_values.is_empty() {
        return Err(Error::EmptyMeasures)
            .into_report()
            .describe_lazy(|| format!("no measures returned for component '{}'", job.component_key));
    }

    // Preserve the configured key order in the header/row rather than
    // whatever order the backend happened to respond in, and drop any
    // requested key the backend didn't have a value for.
    let ordered_keys: Vec<String> = metrics
        .measure_keys()
        .iter()
        .filter(|key| fetched_values.contains_key(*key))
        .cloned()
        .collect();

    let data_source_segment = job
        .data_source_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unscoped".to_string());
    let path = destination_path(export_root, run.project_key(), &data_source_segment, job.job_id);

    let record_count = append_row(&path, &job.component_key, run.commit_sha(), &ordered_keys, &fetched_values).await?;

    let repo_name = run
        .project_key()
        .rsplit('/')
        .next()
        .unwrap_or_else(|| run.project_key())
        .to_string();

    db.upsert_output(
        job.job_id,
        &path.to_string_lossy(),
        run.project_key(),
        &repo_name,
        ordered_keys,
        record_count,
    )
    .await
    .change_context(Error::Persist)?;

    db.update_sonar_run(
        &job.component_key,
        SonarRunStatus::Succeeded,
        job.analysis_id.as_deref(),
        None,
        Some(&path.to_string_lossy()),
        None,
    )
    .await
    .change_context(Error::Persist)?;

    info!(path = %path.display(), record_count, "exported metrics row");
    Ok(())
}

/// Compute `exports/<project>/<data_source>/<job>_metrics.csv`, sanitizing
/// each segment to `[A-Za-z0-9_-]`.
fn destination_path(export_root: &Path, project_key: &str, data_source_segment: &str, job_id: Id) -> PathBuf {
    export_root
        .join(sanitize_segment(project_key))
        .join(sanitize_segment(data_source_segment))
        .join(format!("{job_id}_metrics.csv"))
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`, so a path
/// segment derived from untrusted project/data-source identifiers can't
/// traverse or collide with sibling directories.
fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Append one row under an exclusive lock on `path`, writing the header row
/// first if the file is new or empty, then return the post-append data row
/// count.
async fn append_row(
    path: &Path,
    component_key: &str,
    commit_sha: &str,
    metrics: &[String],
    values: &HashMap<String, String>,
) -> Result<i64, Error> {
    let path = path.to_path_buf();
    let component_key = component_key.to_string();
    let commit_sha = commit_sha.to_string();
    let metrics = metrics.to_vec();
    let values = values.clone();

    crate::ext::io::spawn_blocking_stacked(move || -> error_stack::Result<i64, Error> {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .into_report()
                .change_context(Error::FileIO)
                .describe_lazy(|| format!("create export directory {parent:?}"))?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .into_report()
            .change_context(Error::FileIO)
            .describe_lazy(|| format!("open output file {path:?}"))?;

        file.lock_exclusive()
            .into_report()
            .change_context(Error::FileIO)
            .describe_lazy(|| format!("acquire exclusive lock on {path:?}"))?;

        let is_empty = file
            .metadata()
            .into_report()
            .change_context(Error::FileIO)?
            .len()
            == 0;

        if is_empty {
            let mut header = String::from("component_key,commit_sha");
            for metric in &metrics {
                header.push(',');
                header.push_str(metric);
            }
            header.push('\n');
            file.write_all(header.as_bytes())
                .into_report()
                .change_context(Error::FileIO)?;
        }

        let mut row = format!("{component_key},{commit_sha}");
        for metric in &metrics {
            row.push(',');
            row.push_str(values.get(metric).map(String::as_str).unwrap_or(""));
        }
        row.push('\n');
        file.write_all(row.as_bytes())
            .into_report()
            .change_context(Error::FileIO)?;
        file.flush().into_report().change_context(Error::FileIO)?;

        let content = std::fs::read_to_string(&path)
            .into_report()
            .change_context(Error::FileIO)?;
        // One header row plus N data rows; saturating in case the file
        // somehow has no header yet (shouldn't happen given the write above).
        let record_count = content.lines().count().saturating_sub(1) as i64;

        fs2::FileExt::unlock(&file).into_report().change_context(Error::FileIO)?;
        Ok(record_count)
    })
    .await
    .change_context(Error::FileIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_segment_strips_disallowed_chars() {
        assert_eq!(sanitize_segment("owner/repo"), "owner_repo");
        assert_eq!(sanitize_segment("plain-name_1"), "plain-name_1");
        assert_eq!(sanitize_segment("weird!!chars??"), "weird__chars__");
    }

    #[test]
    fn destination_path_is_scoped_per_job() {
        let root = PathBuf::from("/tmp/exports");
        let job_id = Id::nil();
        let path = destination_path(&root, "owner/repo", "ds-1", job_id);
        assert_eq!(path, root.join("owner_repo").join("ds-1").join(format!("{job_id}_metrics.csv")));
    }

    #[tokio::test]
    async fn append_row_writes_header_once_and_recounts_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let metrics = vec!["coverage".to_string(), "ncloc".to_string()];

        let mut values = HashMap::new();
        values.insert("coverage".to_string(), "87.5".to_string());
        values.insert("ncloc".to_string(), "1200".to_string());

        let first = append_row(&path, "proj_a", "sha1", &metrics, &values).await.expect("first append");
        assert_eq!(first, 1);

        let second = append_row(&path, "proj_a", "sha2", &metrics, &values).await.expect("second append");
        assert_eq!(second, 2);

        let content = std::fs::read_to_string(&path).expect("read output");
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("component_key,commit_sha,coverage,ncloc"));
        assert_eq!(lines.next(), Some("proj_a,sha1,87.5,1200"));
        assert_eq!(lines.next(), Some("proj_a,sha2,87.5,1200"));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn concurrent_appends_produce_one_header_and_correct_row_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("concurrent.csv");
        let metrics = vec!["coverage".to_string()];

        let mut handles = Vec::new();
        for i in 0..8 {
            let path = path.clone();
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                let mut values = HashMap::new();
                values.insert("coverage".to_string(), i.to_string());
                append_row(&path, &format!("proj_{i}"), "sha", &metrics, &values).await.expect("append")
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let content = std::fs::read_to_string(&path).expect("read output");
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("component_key,commit_sha,coverage"));
        assert_eq!(lines.count(), 8, "exactly 8 data rows, one per successful append");
    }
}
