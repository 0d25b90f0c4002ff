//! The process's HTTP surface: the analysis backend's webhook callback,
//! the one endpoint with a specified wire contract, plus thin read-only
//! endpoints over the repository store for operator visibility.
//!
//! A thin `axum` layer over [`crate::webhook`]'s pure correlation logic:
//! this module's only job is translating the analysis backend's actual
//! wire shape (`project.key`, `analysis.key`/`analysisId`,
//! `qualityGate.status`/`status`) into the normalized
//! [`crate::webhook::WebhookPayload`] that module operates on, and
//! translating its `Outcome`/`Error` into HTTP status codes.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::{
    config::WebhookConfig,
    db::Database,
    exporter::ExportJob,
    model::{CommitTask, DeadLetterStatus, Id},
    queue::{Priority, Sender},
    webhook::{self, BackendVerdict, Outcome, WebhookHeaders, WebhookPayload},
};

/// Shared state threaded through every handler.
pub struct AppState<D> {
    /// The repository store.
    pub db: Arc<D>,
    /// Webhook authentication configuration.
    pub webhook_config: Arc<WebhookConfig>,
    /// The sender side of the export queue, for the webhook route's
    /// success path.
    pub export_sender: Arc<Mutex<Sender<ExportJob>>>,
    /// The sender side of the scan queue, for the dead-letter retry route.
    pub scan_sender: Arc<Mutex<Sender<CommitTask>>>,
}

// Implemented by hand for the same reason as `crate::executor::Deps`: the
// derive would add an unconditional `D: Clone` bound even though every
// field is already behind an `Arc`.
impl<D> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            webhook_config: Arc::clone(&self.webhook_config),
            export_sender: Arc::clone(&self.export_sender),
            scan_sender: Arc::clone(&self.scan_sender),
        }
    }
}

/// Build the router, wiring every route to its handler over `state`.
pub fn router<D: Database + 'static>(state: AppState<D>) -> Router {
    Router::new()
        .route("/sonar/webhook", post(webhook_route::<D>))
        .route("/data_sources/:id", get(get_data_source::<D>))
        .route("/jobs/:id", get(get_job::<D>))
        .route("/dead_letters", get(list_dead_letters::<D>))
        .route("/dead_letters/:id", get(get_dead_letter::<D>))
        .route("/dead_letters/:id/retry", post(retry_dead_letter::<D>))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// The analysis backend's actual webhook wire shape, translated into
/// [`WebhookPayload`] below rather than matched field-for-field against it,
/// since the backend nests `project.key` and `qualityGate.status` while
/// this crate's internal representation is flat.
#[derive(Debug, Deserialize)]
struct RawWebhookBody {
    project: Option<RawProject>,
    analysis: Option<RawAnalysis>,
    #[serde(rename = "analysisId")]
    analysis_id: Option<String>,
    #[serde(rename = "qualityGate")]
    quality_gate: Option<RawQualityGate>,
    status: Option<String>,
    #[serde(rename = "logRef")]
    log_ref: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    key: String,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQualityGate {
    status: Option<String>,
}

/// Classify a raw backend status string into a [`BackendVerdict`].
///
/// Success verdicts are `{ok, success, succeeded}` (case-insensitive).
/// Anything recognizable as an error token is a failure; everything else
/// (e.g. `IN_PROGRESS`, `PENDING`) is treated as still running.
fn classify_verdict(status: &str) -> BackendVerdict {
    let normalized = status.to_ascii_lowercase();
    match normalized.as_str() {
        "ok" | "success" | "succeeded" => BackendVerdict::Success,
        "error" | "failed" | "failure" => BackendVerdict::Failure,
        _ => BackendVerdict::Pending,
    }
}

impl RawWebhookBody {
    /// Translate this raw body into the normalized payload
    /// [`webhook::handle`] expects, or `None` if it carries no project key
    /// at all, which the route handler treats as a 400.
    fn into_payload(self) -> Option<WebhookPayload> {
        let component_key = self.project.map(|p| p.key)?;
        let status_str = self
            .quality_gate
            .and_then(|qg| qg.status)
            .or(self.status)
            .unwrap_or_default();

        Some(WebhookPayload {
            component_key,
            status: classify_verdict(&status_str),
            analysis_id: self.analysis.and_then(|a| a.key).or(self.analysis_id),
            log_ref: self.log_ref,
            message: self.message,
        })
    }
}

fn extract_headers(headers: &HeaderMap) -> WebhookHeaders {
    WebhookHeaders {
        token: headers
            .get(webhook::TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        signature: headers
            .get(webhook::SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

/// `POST /sonar/webhook`, the analysis backend's scan-completion callback.
async fn webhook_route<D: Database>(State(state): State<AppState<D>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let webhook_headers = extract_headers(&headers);

    let raw: RawWebhookBody = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid JSON body"}))).into_response(),
    };

    let Some(payload) = raw.into_payload() else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing project key"}))).into_response();
    };

    let result = webhook::handle(state.db.as_ref(), &state.webhook_config, &webhook_headers, &body, payload).await;

    match result {
        Ok(Outcome::Export(job)) => {
            if let Err(report) = state
                .export_sender
                .lock()
                .await
                .send(job, Priority::Normal)
                .await
            {
                error!(error = ?report, "failed to enqueue export job after webhook callback");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "failed to enqueue export"}))).into_response();
            }
            (StatusCode::OK, Json(json!({"received": true}))).into_response()
        }
        Ok(Outcome::Noop) => (StatusCode::OK, Json(json!({"received": true}))).into_response(),
        Err(report) => match report.current_context() {
            webhook::Error::Unauthenticated => StatusCode::UNAUTHORIZED.into_response(),
            webhook::Error::NotFound => StatusCode::NOT_FOUND.into_response(),
            webhook::Error::ParsePayload => StatusCode::BAD_REQUEST.into_response(),
            webhook::Error::Persist => {
                error!(error = ?report, "failed to persist webhook callback");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}

#[derive(Debug, Deserialize)]
struct DeadLetterListQuery {
    status: Option<String>,
}

async fn get_data_source<D: Database>(State(state): State<AppState<D>>, Path(id): Path<Id>) -> Response {
    match state.db.get_data_source(id).await {
        Ok(Some(source)) => Json(source).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(report) => {
            error!(error = ?report, "failed to fetch data source");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_job<D: Database>(State(state): State<AppState<D>>, Path(id): Path<Id>) -> Response {
    match state.db.get_job(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(report) => {
            error!(error = ?report, "failed to fetch job");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_dead_letters<D: Database>(State(state): State<AppState<D>>, Query(query): Query<DeadLetterListQuery>) -> Response {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<DeadLetterStatus>() {
            Ok(status) => Some(status),
            Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "unrecognized status"}))).into_response(),
        },
    };

    match state.db.list_dead_letters(status).await {
        Ok(letters) => Json(letters).into_response(),
        Err(report) => {
            error!(error = ?report, "failed to list dead letters");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_dead_letter<D: Database>(State(state): State<AppState<D>>, Path(id): Path<Id>) -> Response {
    match state.db.get_dead_letter(id).await {
        Ok(Some(letter)) => Json(letter).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(report) => {
            error!(error = ?report, "failed to fetch dead letter");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `POST /dead_letters/:id/retry`: optionally replace the dead letter's
/// `config_override`, then re-enqueue its original payload onto the scan
/// queue with a fresh retry counter.
///
/// The request body is the new override config as a JSON object; omit it
/// (or send `{}`/`null`) to retry with the override already on file.
async fn retry_dead_letter<D: Database>(State(state): State<AppState<D>>, Path(id): Path<Id>, body: axum::body::Bytes) -> Response {
    let letter = match state.db.get_dead_letter(id).await {
        Ok(Some(letter)) => letter,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(report) => {
            error!(error = ?report, "failed to fetch dead letter");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if !body.is_empty() {
        let override_value: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid JSON body"}))).into_response(),
        };
        let override_value = (!override_value.is_null()).then_some(override_value);
        if let Err(report) = state.db.set_dead_letter_override(id, override_value).await {
            error!(error = ?report, "failed to update dead letter override");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let config_override = letter.config_override().clone().or_else(|| letter.payload().config_override().clone());
    let task = CommitTask::new(
        letter.payload().project_key().clone(),
        letter.payload().commit_sha().clone(),
        letter.payload().repo_url().clone(),
        letter.payload().repo_slug().clone(),
        config_override,
        *letter.payload().job_id(),
        *letter.payload().data_source_id(),
        0,
    );

    if let Err(report) = state.scan_sender.lock().await.send(task, Priority::High).await {
        error!(error = ?report, "failed to re-enqueue dead-lettered commit task");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Err(report) = state.db.set_dead_letter_status(id, DeadLetterStatus::Queued).await {
        error!(error = ?report, "failed to mark dead letter queued");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (StatusCode::OK, Json(json!({"requeued": true}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_verdict_recognizes_success_tokens_case_insensitively() {
        assert_eq!(classify_verdict("OK"), BackendVerdict::Success);
        assert_eq!(classify_verdict("Success"), BackendVerdict::Success);
    }

    #[test]
    fn classify_verdict_recognizes_failure_tokens() {
        assert_eq!(classify_verdict("ERROR"), BackendVerdict::Failure);
    }

    #[test]
    fn classify_verdict_defaults_unknown_to_pending() {
        assert_eq!(classify_verdict("IN_PROGRESS"), BackendVerdict::Pending);
    }

    #[test]
    fn raw_body_prefers_quality_gate_status_over_top_level() {
        let raw: RawWebhookBody = serde_json::from_str(
            r#"{"project":{"key":"proj_abc"},"qualityGate":{"status":"OK"},"status":"ERROR"}"#,
        )
        .expect("parse");
        let payload = raw.into_payload().expect("has project key");
        assert_eq!(payload.status, BackendVerdict::Success);
    }

    #[test]
    fn raw_body_without_project_key_is_rejected() {
        let raw: RawWebhookBody = serde_json::from_str(r#"{"status":"ok"}"#).expect("parse");
        assert!(raw.into_payload().is_none());
    }

    #[test]
    fn raw_body_falls_back_to_analysis_id_field() {
        let raw: RawWebhookBody = serde_json::from_str(
            r#"{"project":{"key":"proj_abc"},"status":"ok","analysisId":"a-42"}"#,
        )
        .expect("parse");
        let payload = raw.into_payload().expect("has project key");
        assert_eq!(payload.analysis_id.as_deref(), Some("a-42"));
    }
}
