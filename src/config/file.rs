//! Types and functions for parsing & validating config files.
//!
//! This module owns version dispatch and the validated [`Config`] type
//! consumers actually use, while `file::v1` owns the version-specific raw
//! shape and its validation.

use std::{net::SocketAddr, path::Path, time::Duration};

use error_stack::{Result, ResultExt};
use getset::{CopyGetters, Getters};
use url::Url;

use crate::{
    api::http::Auth,
    debug,
    ext::{
        error_stack::{DescribeContext, ErrorHelper},
        secrecy::ComparableSecretString,
    },
};

pub mod v1;

/// Errors that are possibly surfaced when loading the config file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading the config file from disk failed.
    #[error("read config file")]
    Read,

    /// The config file failed to parse or validate.
    #[error("parse and validate config file")]
    ParseAndValidate,
}

/// Load and validate the config file at the provided path.
///
/// This crate supports exactly one schema version today; the dispatch point
/// exists so a future `version: 2` config file can be routed to a
/// `file::v2` module without disturbing this function's callers.
pub async fn load(location: &Path) -> Result<Config, Error> {
    let content = tokio::fs::read_to_string(location)
        .await
        .context(Error::Read)
        .describe_lazy(|| format!("read config file at {location:?}"))
        .help("verify that the config file exists and that this process has permission to read it")?;

    v1::load(content).await.change_context(Error::ParseAndValidate)
}

/// Validated config values used throughout the process's runtime.
///
/// Every field here has already been checked for well-formedness (valid
/// URLs, non-empty secrets, at least one backend, ...); nothing downstream
/// of this type needs to re-validate.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Config {
    /// Analysis backend instances this process may dispatch scans to.
    #[getset(get = "pub")]
    pub(super) backends: Vec<BackendInstance>,

    /// Path to the SQLite database file, if set in the config file (the
    /// `--database` CLI flag, when provided, takes precedence over this).
    pub(super) database: Option<std::path::PathBuf>,

    /// Whether a commit failure stops its job or is tolerated.
    #[getset(get_copy = "pub")]
    pub(super) failure_policy: FailurePolicy,

    /// Retry/backoff policy for commit-scan task execution (default 3
    /// attempts).
    #[getset(get = "pub")]
    pub(super) task_retry: RetryPolicy,

    /// Retry/backoff policy for metrics export (default 5 attempts).
    #[getset(get = "pub")]
    pub(super) export_retry: RetryPolicy,

    /// Fork discovery configuration.
    #[getset(get = "pub")]
    pub(super) fork_finder: ForkFinderConfig,

    /// Metrics exporter configuration.
    #[getset(get = "pub")]
    pub(super) metrics: MetricsConfig,

    /// Webhook signature verification configuration.
    #[getset(get = "pub")]
    pub(super) webhook: WebhookConfig,

    /// Address the webhook HTTP server binds to.
    #[getset(get_copy = "pub")]
    pub(super) webhook_bind: SocketAddr,

    /// Name or path of the scanner binary this process invokes against each
    /// prepared worktree.
    #[getset(get = "pub")]
    pub(super) scanner_binary: String,

    /// How often the reconciler sweeps for stale claimed work.
    #[getset(get_copy = "pub")]
    pub(super) reconcile_interval: Duration,

    /// Observability configuration.
    #[getset(get = "pub")]
    pub(super) debug: debug::Config,
}

impl Config {
    /// The database path from the config file, if the caller didn't provide
    /// an explicit `--database` argument.
    pub fn database_path(&self) -> Option<&std::path::Path> {
        self.database.as_deref()
    }

    /// Look up a configured backend instance by name.
    pub fn backend(&self, name: &str) -> Option<&BackendInstance> {
        self.backends.iter().find(|b| b.name == name)
    }
}

/// One analysis backend instance this process may dispatch scans to.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct BackendInstance {
    /// The name used to key admission accounting and `Job::assigned_backend_instance`.
    #[getset(get = "pub")]
    pub(super) name: String,

    /// The backend's base URL.
    #[getset(get = "pub")]
    pub(super) host: Url,

    /// Credentials used to authenticate requests to this backend.
    #[getset(get = "pub")]
    pub(super) auth: Auth,

    /// Maximum number of concurrently-running scans this instance accepts.
    #[getset(get_copy = "pub")]
    pub(super) max_concurrent: i64,
}

/// Whether a commit failure stops its job or is tolerated, resolving the
/// open question of whether the scheduler should treat any failure as fatal
/// to the whole job or keep making progress on the remaining commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The first commit failure in a job marks the whole job failed.
    FailFast,
    /// A commit failure is dead-lettered but the job continues.
    ResumeFailedCommits,
}

/// Retry/backoff policy for commit execution and queue redelivery.
#[derive(Debug, Clone, Copy, Getters, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct RetryPolicy {
    /// Initial delay before the first retry.
    pub(super) base_delay: Duration,
    /// Ceiling the exponential backoff is capped at.
    pub(super) max_delay: Duration,
    /// Maximum number of attempts before the task is dead-lettered.
    pub(super) max_attempts: u32,
}

/// Fork discovery configuration.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct ForkFinderConfig {
    /// Hosting API tokens, rotated round-robin across requests.
    #[getset(get = "pub")]
    pub(super) tokens: Vec<ComparableSecretString>,
    /// Maximum number of fork pages to walk before giving up.
    #[getset(get_copy = "pub")]
    pub(super) max_pages: u32,
    /// Hosting API base URL.
    #[getset(get = "pub")]
    pub(super) api_base: Url,
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct MetricsConfig {
    /// Metric keys requested from the analysis backend.
    #[getset(get = "pub")]
    pub(super) measure_keys: Vec<String>,
    /// Number of components fetched per `measures/component` request.
    #[getset(get_copy = "pub")]
    pub(super) chunk_size: u32,
    /// Root directory under which per-project CSV files are appended.
    #[getset(get = "pub")]
    pub(super) export_root: std::path::PathBuf,
}

/// Webhook signature verification configuration.
#[derive(Debug, Clone, Getters, derive_new::new)]
#[getset(get = "pub")]
pub struct WebhookConfig {
    /// Shared secret used for HMAC-SHA256 signature verification.
    pub(super) hmac_secret: Option<ComparableSecretString>,
    /// Shared token accepted via a header instead of a signature.
    pub(super) token: Option<ComparableSecretString>,
}
