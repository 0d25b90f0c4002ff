//! Verifies and applies analysis-backend webhook callbacks: a raw request
//! body plus either a shared token or an HMAC-SHA256 signature header,
//! correlated to a tracked `SonarRun` by component key.
//!
//! Signature verification follows the same constant-time-comparison
//! discipline as [`crate::ext::secrecy::ComparableSecretString`], computing
//! the HMAC with `hmac`+`sha2` the way the rest of this crate reaches for
//! `sha2` (the worktree manager's content-addressed override configs).

use error_stack::{IntoReport, Result, ResultExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::info;

use crate::{
    config::WebhookConfig,
    ext::{error_stack::DescribeContext, secrecy::ComparableSecretString},
    exporter::ExportJob,
    model::{Id, SonarRunStatus},
};

type HmacSha256 = Hmac<Sha256>;

/// The header carrying a shared-token credential, checked before falling
/// back to signature verification.
pub const TOKEN_HEADER: &str = "x-sonar-secret";

/// The header carrying the hex-encoded HMAC-SHA256 signature of the raw body.
pub const SIGNATURE_HEADER: &str = "x-sonar-webhook-hmac-sha256";

/// Errors encountered handling a webhook callback.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither a token nor a signature header was present, or the one
    /// present didn't match the configured secret.
    #[error("webhook request failed authentication")]
    Unauthenticated,

    /// The request body didn't parse as a recognized callback payload.
    #[error("parse webhook payload")]
    ParsePayload,

    /// The callback's component key has no tracked `SonarRun`.
    #[error("component is not tracked")]
    NotFound,

    /// The repository store rejected the lookup or update.
    #[error("query or update repository store")]
    Persist,
}

/// The analysis backend's reported verdict for a component's scan, decoupled
/// from [`SonarRunStatus`] so this module can classify "does this count as
/// success" without the backend's exact vocabulary leaking into the domain
/// model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendVerdict {
    /// The scan completed and measures are ready to fetch.
    Success,
    /// The scan failed on the backend side after being submitted.
    Failure,
    /// The scan is still running; no further action is taken yet.
    Pending,
}

impl From<BackendVerdict> for SonarRunStatus {
    fn from(verdict: BackendVerdict) -> Self {
        match verdict {
            BackendVerdict::Success => SonarRunStatus::Succeeded,
            BackendVerdict::Failure => SonarRunStatus::Failed,
            BackendVerdict::Pending => SonarRunStatus::Running,
        }
    }
}

/// The body of a callback from the analysis backend.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    /// The component key the backend is reporting on.
    pub component_key: String,
    /// The backend's verdict for this component's scan.
    pub status: BackendVerdict,
    /// The backend-assigned analysis id, for correlation and audit.
    #[serde(default)]
    pub analysis_id: Option<String>,
    /// A link to the backend's own log/report for this analysis, if any.
    #[serde(default)]
    pub log_ref: Option<String>,
    /// A human-readable message, typically populated on failure.
    #[serde(default)]
    pub message: Option<String>,
}

/// The headers relevant to webhook authentication, extracted by the caller
/// from whatever HTTP framework it uses (kept framework-agnostic here so
/// this module is independently testable from [`crate::http`]).
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    /// Value of [`TOKEN_HEADER`], if present.
    pub token: Option<String>,
    /// Value of [`SIGNATURE_HEADER`], if present.
    pub signature: Option<String>,
}

/// The outcome of successfully applying a webhook callback: whether an
/// export should now be enqueued, and with what correlation.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The verdict was a success; the caller should enqueue this export job.
    Export(ExportJob),
    /// The verdict was a failure or still pending; nothing further to do.
    Noop,
}

/// Verify the request's authentication: a token header takes precedence
/// over a signature header; if neither is present, or the one present
/// doesn't match, the request is rejected.
fn authenticate(config: &WebhookConfig, headers: &WebhookHeaders, raw_body: &[u8]) -> Result<(), Error> {
    if let Some(token) = &headers.token {
        let configured = config
            .token()
            .as_ref()
            .ok_or(Error::Unauthenticated)
            .into_report()
            .describe("a token header was presented but no token is configured")?;
        let presented = ComparableSecretString::from(token.clone());
        return if presented == *configured {
            Ok(())
        } else {
            Err(Error::Unauthenticated).into_report().describe("presented token did not match")
        };
    }

    if let Some(signature) = &headers.signature {
        let secret = config
            .hmac_secret()
            .as_ref()
            .ok_or(Error::Unauthenticated)
            .into_report()
            .describe("a signature header was presented but no HMAC secret is configured")?;
        return verify_signature(secret, raw_body, signature);
    }

    Err(Error::Unauthenticated)
        .into_report()
        .describe("request carried neither a token nor a signature header")
}

fn verify_signature(secret: &ComparableSecretString, raw_body: &[u8], presented_hex: &str) -> Result<(), Error> {
    use secrecy::ExposeSecret;

    let presented = hex::decode(presented_hex.trim())
        .into_report()
        .change_context(Error::Unauthenticated)
        .describe("signature header was not valid hex")?;

    let mut mac = HmacSha256::new_from_slice(secret.as_ref().expose_secret().as_bytes())
        .into_report()
        .change_context(Error::Unauthenticated)
        .describe("HMAC key of any length is valid for SHA-256, so this should never fail")?;
    mac.update(raw_body);

    mac.verify_slice(&presented)
        .into_report()
        .change_context(Error::Unauthenticated)
        .describe("HMAC signature did not match")
}

/// Verify and apply one webhook callback: authenticate, look up the tracked
/// `SonarRun`, upsert its reported status, and signal whether an export
/// should be enqueued.
#[tracing::instrument(skip(db, config, headers, raw_body, payload), fields(component_key = %payload.component_key))]
pub async fn handle<D: crate::db::Database>(
    db: &D,
    config: &WebhookConfig,
    headers: &WebhookHeaders,
    raw_body: &[u8],
    payload: WebhookPayload,
) -> Result<Outcome, Error> {
    authenticate(config, headers, raw_body)?;

    let run = db
        .get_sonar_run_by_component_key(&payload.component_key)
        .await
        .change_context(Error::Persist)?
        .ok_or(Error::NotFound)
        .into_report()
        .describe_lazy(|| format!("component '{}' has no tracked SonarRun", payload.component_key))?;

    let status: SonarRunStatus = payload.status.into();
    db.update_sonar_run(
        &payload.component_key,
        status,
        payload.analysis_id.as_deref(),
        payload.log_ref.as_deref(),
        None,
        payload.message.as_deref(),
    )
    .await
    .change_context(Error::Persist)?;

    info!(status = %status, "applied webhook callback");

    match payload.status {
        BackendVerdict::Success => {
            // `SonarRun` doesn't carry a job id directly; it shares a
            // natural key `(project_key, commit_sha)` with `CommitTask`,
            // which does.
            let job_id = run_job_id(db, &run).await.change_context(Error::Persist)?;
            Ok(Outcome::Export(ExportJob::from_webhook(
                payload.component_key,
                job_id,
                Some(*run.data_source_id()),
                payload.analysis_id,
            )))
        }
        BackendVerdict::Failure | BackendVerdict::Pending => Ok(Outcome::Noop),
    }
}

/// Resolve the owning `Job` id for a `SonarRun` via its `(project_key,
/// commit_sha)` natural key, since `SonarRun` itself doesn't carry a job id
/// (`CommitTask` does, and the two share a natural key).
async fn run_job_id<D: crate::db::Database>(db: &D, run: &crate::model::SonarRun) -> Result<Id, crate::db::Error> {
    let task = db
        .get_commit_task(run.project_key(), run.commit_sha())
        .await?
        .ok_or(crate::db::Error::NotFound)
        .into_report()
        .describe_lazy(|| format!("no CommitTask for '{}'@'{}'", run.project_key(), run.commit_sha()))?;
    Ok(*task.job_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_token(token: &str) -> WebhookConfig {
        WebhookConfig::new(None, Some(ComparableSecretString::from(token.to_string())))
    }

    fn config_with_hmac(secret: &str) -> WebhookConfig {
        WebhookConfig::new(Some(ComparableSecretString::from(secret.to_string())), None)
    }

    #[test]
    fn authenticate_accepts_matching_token() {
        let config = config_with_token("s3cret");
        let headers = WebhookHeaders {
            token: Some("s3cret".to_string()),
            signature: None,
        };
        assert!(authenticate(&config, &headers, b"{}").is_ok());
    }

    #[test]
    fn authenticate_rejects_mismatched_token() {
        let config = config_with_token("s3cret");
        let headers = WebhookHeaders {
            token: Some("wrong".to_string()),
            signature: None,
        };
        assert!(authenticate(&config, &headers, b"{}").is_err());
    }

    #[test]
    fn authenticate_rejects_missing_credentials() {
        let config = config_with_token("s3cret");
        let headers = WebhookHeaders::default();
        assert!(authenticate(&config, &headers, b"{}").is_err());
    }

    #[test]
    fn authenticate_accepts_valid_hmac_signature() {
        let config = config_with_hmac("s3cret");
        let body = br#"{"component_key":"proj_abc"}"#;

        let mut mac = HmacSha256::new_from_slice(b"s3cret").expect("valid key");
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let headers = WebhookHeaders {
            token: None,
            signature: Some(signature),
        };
        assert!(authenticate(&config, &headers, body).is_ok());
    }

    #[test]
    fn authenticate_rejects_tampered_body_against_hmac_signature() {
        let config = config_with_hmac("s3cret");
        let signed_body = br#"{"component_key":"proj_abc"}"#;

        let mut mac = HmacSha256::new_from_slice(b"s3cret").expect("valid key");
        mac.update(signed_body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let headers = WebhookHeaders {
            token: None,
            signature: Some(signature),
        };
        let tampered_body = br#"{"component_key":"proj_xyz"}"#;
        assert!(authenticate(&config, &headers, tampered_body).is_err());
    }

    #[test]
    fn payload_parses_success_verdict() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"component_key":"proj_abc123","status":"success","analysis_id":"a-1"}"#,
        )
        .expect("parse payload");
        assert_eq!(payload.status, BackendVerdict::Success);
        assert_eq!(payload.analysis_id.as_deref(), Some("a-1"));
    }
}
