//! A thin HTTP client for the external analysis backend (e.g. a SonarQube-
//! compatible server): the idempotency pre-check (`projects/search`) the
//! commit executor uses before dispatching a scan, and the chunked
//! `measures/component` fetch the metrics exporter uses afterward.
//!
//! Request construction and auth handling reuse `api::http::Auth` for the
//! header-or-basic credential shape rather than inventing a second one.

use std::collections::HashMap;

use error_stack::{IntoReport, Result, ResultExt};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::BackendInstance,
    ext::error_stack::{DescribeContext, ErrorHelper},
    api::http::Auth,
};

/// Errors encountered communicating with an analysis backend instance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Building the HTTP client failed.
    #[error("build http client")]
    BuildClient,

    /// The underlying HTTP request failed (connection, timeout, ...).
    #[error("send request to analysis backend")]
    Request,

    /// The backend responded, but the response did not parse as expected.
    #[error("parse analysis backend response")]
    ParseResponse,

    /// The backend responded with a non-success, non-retryable status.
    #[error("analysis backend returned an error status")]
    ErrorStatus,
}

/// Per-component metric values, as returned by `measures/component`.
pub type Measures = HashMap<String, String>;

/// A single analysis backend instance's HTTP client.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: reqwest::Url,
    auth: Auth,
}

impl Client {
    /// Build a client for the provided backend instance.
    pub fn new(instance: &BackendInstance) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .build()
            .into_report()
            .change_context(Error::BuildClient)?;

        Ok(Self {
            http,
            base: instance.host().clone(),
            auth: instance.auth().clone(),
        })
    }

    /// Apply this client's configured auth to a request builder.
    fn authenticate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Auth::Header(token) => request.bearer_auth(expose(token)),
            Auth::Basic { username, password } => request.basic_auth(username, Some(expose(password))),
        }
    }

    /// Whether a component with the given key already exists on this
    /// backend, the executor's idempotency pre-check before dispatching a
    /// scan.
    #[tracing::instrument(skip(self), fields(component_key))]
    pub async fn component_exists(&self, component_key: &str) -> Result<bool, Error> {
        let url = self
            .base
            .join("api/projects/search")
            .into_report()
            .change_context(Error::Request)?;

        let response = self
            .authenticate(self.http.get(url).query(&[("q", component_key)]))
            .send()
            .await
            .into_report()
            .change_context(Error::Request)
            .describe_lazy(|| format!("search for component '{component_key}'"))?;

        if !response.status().is_success() {
            return Err(Error::ErrorStatus)
                .into_report()
                .describe_lazy(|| format!("backend returned status {}", response.status()));
        }

        let body: ProjectSearchResponse = response
            .json()
            .await
            .into_report()
            .change_context(Error::ParseResponse)?;

        Ok(body
            .components
            .iter()
            .any(|component| component.key == component_key))
    }

    /// Fetch the requested measures for a chunk of components, as the
    /// metrics exporter does. An empty response map for a
    /// requested component means that component has no recorded measures
    /// (a `SonarRun` that completed but produced nothing countable); an
    /// entirely empty response across the whole chunk is itself treated as
    /// an error by the exporter, not by this client.
    #[tracing::instrument(skip(self, component_keys, measure_keys), fields(chunk_size = component_keys.len()))]
    pub async fn fetch_measures(
        &self,
        component_keys: &[String],
        measure_keys: &[String],
    ) -> Result<HashMap<String, Measures>, Error> {
        let url = self
            .base
            .join("api/measures/component")
            .into_report()
            .change_context(Error::Request)?;

        let components = component_keys.join(",");
        let metrics = measure_keys.join(",");

        let response = self
            .authenticate(
                self.http
                    .get(url)
                    .query(&[("component", components.as_str()), ("metricKeys", metrics.as_str())]),
            )
            .send()
            .await
            .into_report()
            .change_context(Error::Request)
            .describe("fetch measures/component")?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("one or more requested components were not found");
        } else if !status.is_success() {
            return Err(Error::ErrorStatus)
                .into_report()
                .describe_lazy(|| format!("backend returned status {status}"));
        }

        let body: MeasuresResponse = response
            .json()
            .await
            .into_report()
            .change_context(Error::ParseResponse)?;

        let mut result = HashMap::new();
        for component in body.components {
            let measures = component
                .measures
                .into_iter()
                .map(|measure| (measure.metric, measure.value))
                .collect::<Measures>();
            result.insert(component.key, measures);
        }
        Ok(result)
    }
}

fn expose(secret: &crate::ext::secrecy::ComparableSecretString) -> String {
    use secrecy::ExposeSecret;
    secret.as_ref().expose_secret().to_owned()
}

#[derive(Debug, Deserialize)]
struct ProjectSearchResponse {
    components: Vec<ProjectSearchComponent>,
}

#[derive(Debug, Deserialize)]
struct ProjectSearchComponent {
    key: String,
}

#[derive(Debug, Deserialize)]
struct MeasuresResponse {
    #[serde(default)]
    components: Vec<MeasuresComponent>,
}

#[derive(Debug, Deserialize)]
struct MeasuresComponent {
    key: String,
    #[serde(default)]
    measures: Vec<Measure>,
}

#[derive(Debug, Deserialize)]
struct Measure {
    metric: String,
    value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_response_groups_by_component_key() {
        let body: MeasuresResponse = serde_json::from_str(
            r#"{"components":[{"key":"proj_abc123","measures":[{"metric":"coverage","value":"87.5"}]}]}"#,
        )
        .expect("parse fixture");

        assert_eq!(body.components.len(), 1);
        assert_eq!(body.components[0].measures[0].metric, "coverage");
    }
}
