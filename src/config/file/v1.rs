//! Version 1 of the config file schema.
//!
//! This module owns both the "raw" shape (whatever the YAML literally
//! contains) and the validation that turns it into the strongly-typed
//! [`super::Config`] the rest of the process actually uses.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use error_stack::{IntoReport, Result, ResultExt};
use serde::Deserialize;

use crate::{
    api::http::Auth,
    debug,
    ext::{
        error_stack::{DescribeContext, ErrorDocReference, ErrorHelper},
        secrecy::ComparableSecretString,
    },
};

/// Errors that are possibly surfaced when loading the config file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file did not parse as valid YAML matching this schema.
    #[error("parse config file")]
    Parse,

    /// The file parsed, but one or more values failed validation.
    #[error("validate config file")]
    Validate,
}

/// Parse and validate a version 1 config file.
pub async fn load(content: String) -> Result<super::Config, Error> {
    let raw: RawConfigV1 = serde_yaml::from_str(&content)
        .context(Error::Parse)
        .describe("config files use YAML; check indentation and that every key is spelled correctly")
        .documentation_lazy(crate::doc::link::config_file_reference)?;

    raw.validate().change_context(Error::Validate)
}

/// The "raw" shape of a version 1 config file: whatever the YAML literally
/// contains, prior to any validation. Field names match the YAML keys
/// (`serde`'s default, snake_case) so the schema on disk matches the Rust
/// names one-to-one.
#[derive(Debug, Deserialize)]
struct RawConfigV1 {
    /// Schema version; only `1` is accepted. Defaults to `1` when absent so
    /// existing config files don't need to be touched just to add this key.
    #[serde(default = "default_version")]
    version: u32,

    /// Analysis backend instances this process may dispatch scans to.
    backends: Vec<RawBackendInstance>,

    /// Path to the SQLite database file. Overridden by `--database` if
    /// provided on the command line; this field exists so the config file
    /// alone is sufficient to run headlessly.
    database: Option<PathBuf>,

    /// `fail_fast` or `resume_failed_commits`. Defaults to
    /// `resume_failed_commits`.
    #[serde(default)]
    failure_policy: RawFailurePolicy,

    /// Retry/backoff policy for commit-scan task execution. Defaults to 3
    /// attempts.
    #[serde(default = "RawRetryPolicy::default_task")]
    task_retry: RawRetryPolicy,

    /// Retry/backoff policy for metrics export. Defaults to 5 attempts.
    #[serde(default = "RawRetryPolicy::default_export")]
    export_retry: RawRetryPolicy,

    /// Fork discovery configuration. Optional: a deployment that never needs
    /// to search forks for a missing commit can omit this entirely.
    #[serde(default)]
    fork_finder: RawForkFinderConfig,

    /// Metrics exporter configuration.
    metrics: RawMetricsConfig,

    /// Webhook signature verification configuration.
    webhook: RawWebhookConfig,

    /// Address the webhook HTTP server binds to. Defaults to `0.0.0.0:8080`.
    #[serde(default = "default_webhook_bind")]
    webhook_bind: SocketAddr,

    /// Name or path of the scanner binary. Defaults to `sonar-scanner`,
    /// expected to already be on `PATH` (this crate does not download or
    /// pin a specific scanner release).
    #[serde(default = "default_scanner_binary")]
    scanner_binary: String,

    /// How often the reconciler sweeps for stale claimed work, in seconds.
    /// Defaults to 600 (10 minutes).
    #[serde(default = "default_reconcile_interval_secs")]
    reconcile_interval_secs: u64,

    /// Observability configuration.
    #[serde(default)]
    debug: RawDebugConfig,
}

fn default_version() -> u32 {
    1
}

fn default_reconcile_interval_secs() -> u64 {
    600
}

fn default_webhook_bind() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

fn default_scanner_binary() -> String {
    "sonar-scanner".to_string()
}

impl RawConfigV1 {
    fn validate(self) -> Result<super::Config, Error> {
        if self.version != 1 {
            return Err(Error::Validate).into_report().describe_lazy(|| {
                format!("config file declared version {}, but only version 1 is supported", self.version)
            });
        }

        let mut backends = Vec::with_capacity(self.backends.len());
        for raw in self.backends {
            let backend = raw.validate().change_context(Error::Validate)?;
            backends.push(backend);
        }
        if backends.is_empty() {
            return Err(Error::Validate)
                .into_report()
                .describe("at least one entry is required under 'backends'")
                .help("add at least one backend instance with a host, token, and max_concurrent");
        }

        let task_retry = self.task_retry.validate().change_context(Error::Validate)?;
        let export_retry = self.export_retry.validate().change_context(Error::Validate)?;
        let fork_finder = self.fork_finder.validate().change_context(Error::Validate)?;
        let metrics = self.metrics.validate().change_context(Error::Validate)?;
        let webhook = self.webhook.validate().change_context(Error::Validate)?;
        let debug = self.debug.validate().change_context(Error::Validate)?;

        Ok(super::Config {
            backends,
            database: self.database,
            failure_policy: self.failure_policy.into(),
            task_retry,
            export_retry,
            fork_finder,
            metrics,
            webhook,
            webhook_bind: self.webhook_bind,
            scanner_binary: self.scanner_binary,
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            debug,
        })
    }
}

/// Raw shape of one `backends` list entry.
#[derive(Debug, Deserialize)]
struct RawBackendInstance {
    name: String,
    host: String,
    token: String,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: i64,
}

fn default_max_concurrent() -> i64 {
    1
}

impl RawBackendInstance {
    fn validate(self) -> Result<super::BackendInstance, Error> {
        if self.name.trim().is_empty() {
            return Err(Error::Validate)
                .into_report()
                .describe("every entry under 'backends' requires a non-empty 'name'");
        }
        let host = url::Url::parse(&self.host)
            .into_report()
            .change_context(Error::Validate)
            .describe_lazy(|| format!("backend '{}': parse 'host' as a URL", self.name))
            .help("the host must be an absolute URL including its scheme, e.g. 'https://backend.example.com'")?;
        if self.token.trim().is_empty() {
            return Err(Error::Validate).into_report().describe_lazy(|| {
                format!("backend '{}': 'token' must not be empty", self.name)
            });
        }
        if self.max_concurrent < 1 {
            return Err(Error::Validate).into_report().describe_lazy(|| {
                format!("backend '{}': 'max_concurrent' must be at least 1", self.name)
            });
        }
        Ok(super::BackendInstance {
            name: self.name,
            host,
            auth: Auth::Header(ComparableSecretString::from(self.token)),
            max_concurrent: self.max_concurrent,
        })
    }
}

/// Raw shape of the `failure_policy` key.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawFailurePolicy {
    /// The first commit failure in a job marks the whole job failed and
    /// stops dispatching further commits from it.
    FailFast,
    /// A commit failure is dead-lettered but the job continues; the job is
    /// only marked failed if every remaining commit also fails.
    #[default]
    ResumeFailedCommits,
}

impl From<RawFailurePolicy> for super::FailurePolicy {
    fn from(value: RawFailurePolicy) -> Self {
        match value {
            RawFailurePolicy::FailFast => super::FailurePolicy::FailFast,
            RawFailurePolicy::ResumeFailedCommits => super::FailurePolicy::ResumeFailedCommits,
        }
    }
}

/// Raw shape of the `task_retry`/`export_retry` keys. Two independent
/// instances of this same shape carry different `max_attempts` defaults:
/// 3 at task level, 5 at export level.
#[derive(Debug, Deserialize)]
struct RawRetryPolicy {
    #[serde(default = "default_retry_base_ms")]
    base_delay_ms: u64,
    #[serde(default = "default_retry_max_secs")]
    max_delay_secs: u64,
    max_attempts: u32,
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_max_secs() -> u64 {
    180
}

impl RawRetryPolicy {
    fn default_task() -> Self {
        Self {
            base_delay_ms: default_retry_base_ms(),
            max_delay_secs: default_retry_max_secs(),
            max_attempts: 3,
        }
    }

    fn default_export() -> Self {
        Self {
            base_delay_ms: default_retry_base_ms(),
            max_delay_secs: default_retry_max_secs(),
            max_attempts: 5,
        }
    }

    fn validate(self) -> Result<super::RetryPolicy, Error> {
        if self.max_attempts == 0 {
            return Err(Error::Validate)
                .into_report()
                .describe("'max_attempts' must be at least 1");
        }
        Ok(super::RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            max_attempts: self.max_attempts,
        })
    }
}

/// Raw shape of the `fork_finder` key.
#[derive(Debug, Default, Deserialize)]
struct RawForkFinderConfig {
    /// Hosting API tokens, rotated round-robin across requests.
    #[serde(default)]
    tokens: Vec<String>,
    /// Maximum number of fork pages to walk before giving up.
    #[serde(default = "default_fork_page_cap")]
    max_pages: u32,
    /// Hosting API base URL, e.g. `https://api.github.com`.
    #[serde(default = "default_hosting_api")]
    api_base: String,
}

fn default_fork_page_cap() -> u32 {
    5
}

fn default_hosting_api() -> String {
    "https://api.github.com".to_string()
}

impl RawForkFinderConfig {
    fn validate(self) -> Result<super::ForkFinderConfig, Error> {
        let api_base = url::Url::parse(&self.api_base)
            .into_report()
            .change_context(Error::Validate)
            .describe("parse 'fork_finder.api_base' as a URL")?;
        let tokens = self
            .tokens
            .into_iter()
            .map(ComparableSecretString::from)
            .collect::<Vec<_>>();
        Ok(super::ForkFinderConfig {
            tokens,
            max_pages: self.max_pages,
            api_base,
        })
    }
}

/// Raw shape of the `metrics` key.
#[derive(Debug, Deserialize)]
struct RawMetricsConfig {
    /// Metric keys requested from the analysis backend, e.g. `coverage`,
    /// `ncloc`, `complexity`.
    measure_keys: Vec<String>,
    /// Number of components fetched per `measures/component` request.
    #[serde(default = "default_chunk_size")]
    chunk_size: u32,
    /// Root directory under which per-project CSV files are appended.
    export_root: PathBuf,
}

fn default_chunk_size() -> u32 {
    50
}

impl RawMetricsConfig {
    fn validate(self) -> Result<super::MetricsConfig, Error> {
        if self.measure_keys.is_empty() {
            return Err(Error::Validate)
                .into_report()
                .describe("'metrics.measure_keys' must list at least one measure");
        }
        if self.chunk_size == 0 {
            return Err(Error::Validate)
                .into_report()
                .describe("'metrics.chunk_size' must be at least 1");
        }
        Ok(super::MetricsConfig {
            measure_keys: self.measure_keys,
            chunk_size: self.chunk_size,
            export_root: self.export_root,
        })
    }
}

/// Raw shape of the `webhook` key.
#[derive(Debug, Deserialize)]
struct RawWebhookConfig {
    /// Shared secret used for HMAC-SHA256 signature verification.
    hmac_secret: Option<String>,
    /// Shared token accepted via a header instead of a signature.
    token: Option<String>,
}

impl RawWebhookConfig {
    fn validate(self) -> Result<super::WebhookConfig, Error> {
        if self.hmac_secret.is_none() && self.token.is_none() {
            return Err(Error::Validate).into_report().describe(
                "'webhook' requires at least one of 'hmac_secret' or 'token' so incoming callbacks can be authenticated",
            );
        }
        Ok(super::WebhookConfig {
            hmac_secret: self.hmac_secret.map(ComparableSecretString::from),
            token: self.token.map(ComparableSecretString::from),
        })
    }
}

/// Raw shape of the `debug` key, matching `debug::Config`'s two fields.
#[derive(Debug, Deserialize)]
struct RawDebugConfig {
    /// Directory observability artifacts (trace files, debug bundles) are
    /// written under.
    #[serde(default = "default_debug_root")]
    root: PathBuf,
    /// Number of rotated trace files to retain.
    #[serde(default = "default_retention_days")]
    retention_days: usize,
}

impl Default for RawDebugConfig {
    fn default() -> Self {
        Self {
            root: default_debug_root(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_debug_root() -> PathBuf {
    PathBuf::from("debug")
}

fn default_retention_days() -> usize {
    7
}

impl RawDebugConfig {
    fn validate(self) -> Result<debug::Config, Error> {
        let retention = debug::ArtifactRetentionCount::try_from(self.retention_days)
            .into_report()
            .change_context(Error::Validate)
            .describe("'debug.retention_days' must be at least 1")?;
        Ok(debug::Config::new(
            debug::Root::from(self.root),
            debug::Retention::new(retention),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
backends:
  - name: primary
    host: https://backend.example.com
    token: secret-token
metrics:
  measure_keys: [coverage, ncloc]
  export_root: /tmp/commit-scanner/export
webhook:
  token: webhook-secret
"#;

    #[tokio::test]
    async fn loads_minimal_config() {
        let config = load(MINIMAL.to_string()).await.expect("config must parse");
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].name, "primary");
        assert_eq!(config.failure_policy, super::super::FailurePolicy::ResumeFailedCommits);
        assert_eq!(config.task_retry.max_attempts, 3);
        assert_eq!(config.export_retry.max_attempts, 5);
    }

    #[tokio::test]
    async fn rejects_empty_backends() {
        let content = r#"
backends: []
metrics:
  measure_keys: [coverage]
  export_root: /tmp/export
webhook:
  token: secret
"#;
        let err = load(content.to_string()).await.expect_err("must reject empty backends");
        assert!(format!("{err:?}").contains("at least one entry"));
    }

    #[tokio::test]
    async fn rejects_webhook_with_no_auth() {
        let content = r#"
backends:
  - name: primary
    host: https://backend.example.com
    token: secret-token
metrics:
  measure_keys: [coverage]
  export_root: /tmp/export
webhook: {}
"#;
        let err = load(content.to_string()).await.expect_err("must reject webhook with no auth");
        assert!(format!("{err:?}").contains("hmac_secret"));
    }
}
