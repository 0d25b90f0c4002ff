//! Locates the fork of a repository that contains a commit missing from the
//! canonical repo, by querying an external source-hosting API (GitHub-
//! shaped: GraphQL preferred, REST fallback, paginated forks listing).
//!
//! Used either inline from the commit executor's worktree-fetch step when a
//! commit is absent from origin, or as an operator-triggered discovery
//! workflow run against already-dead-lettered records.
//!
//! HTTP usage follows the same `reqwest`-client-plus-`Auth` shape as
//! [`crate::backend`]; the round-robin token pool rotates via a bare
//! `AtomicUsize` since rotation is advisory and needs no locking for
//! correctness.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use error_stack::{report, IntoReport, Result, ResultExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::ext::{error_stack::DescribeContext, secrecy::ComparableSecretString};

/// Errors encountered while searching for a commit across forks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No hosting-API tokens are configured, so no request can be made.
    #[error("no hosting API tokens configured")]
    NoTokens,

    /// Building the HTTP client failed.
    #[error("build http client")]
    BuildClient,

    /// The underlying HTTP request failed (connection, timeout, ...).
    #[error("send request to hosting API")]
    Request,

    /// The hosting API responded, but the response didn't parse as expected.
    #[error("parse hosting API response")]
    ParseResponse,

    /// The hosting API returned a non-success, non-rate-limit status.
    #[error("hosting API returned an error status")]
    ErrorStatus,

    /// `HTTP 403` with `X-RateLimit-Remaining: 0`. Surfaced directly to the
    /// caller rather than counted as a scan failure.
    #[error("hosting API rate limit exhausted")]
    RateLimited,
}

/// One page of a repository's forks.
const FORKS_PER_PAGE: u32 = 100;

/// How many SHAs are batched into a single GraphQL existence-probe query.
const GRAPHQL_BATCH: usize = 50;

/// A client for the source-hosting API used to discover forks.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    api_base: Url,
    tokens: Vec<ComparableSecretString>,
    cursor: AtomicUsize,
}

impl Client {
    /// Build a client rotating across the provided token pool.
    pub fn new(api_base: Url, tokens: Vec<ComparableSecretString>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent("commit-scanner")
            .build()
            .into_report()
            .change_context(Error::BuildClient)?;
        Ok(Self {
            http,
            api_base,
            tokens,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The next token in the round-robin rotation.
    fn next_token(&self) -> Result<&ComparableSecretString, Error> {
        if self.tokens.is_empty() {
            return Err(report!(Error::NoTokens))
                .describe("at least one entry is required under 'fork_finder.tokens' to query the hosting API");
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.tokens.len();
        Ok(&self.tokens[i])
    }

    /// Apply the current round-robin token as a bearer credential.
    fn authenticate(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, Error> {
        use secrecy::ExposeSecret;
        let token = self.next_token()?;
        Ok(request.bearer_auth(token.as_ref().expose_secret()))
    }

    /// Whether `commit_sha` exists in `slug`, via GraphQL bulk lookup
    /// (aliased `object(expression: ...)` fields), falling back to the REST
    /// single-commit endpoint if the GraphQL request itself fails outright.
    async fn probe(&self, slug: &str, commit_sha: &str) -> Result<bool, Error> {
        let mut result = self.probe_many(slug, std::slice::from_ref(&commit_sha.to_string())).await?;
        Ok(result.remove(commit_sha).unwrap_or(false))
    }

    /// Bulk existence probe for many SHAs against one repository slug, used
    /// by both the single-commit probe and the bulk cross-fork search.
    async fn probe_many(&self, slug: &str, shas: &[String]) -> Result<HashMap<String, bool>, Error> {
        let mut found = HashMap::new();
        for chunk in shas.chunks(GRAPHQL_BATCH) {
            match self.probe_graphql(slug, chunk).await {
                Ok(partial) => found.extend(partial),
                Err(report) if matches!(report.current_context(), Error::RateLimited) => return Err(report),
                Err(_) => {
                    debug!(slug, "GraphQL probe failed, falling back to REST per-commit lookups");
                    for sha in chunk {
                        let exists = self.probe_rest(slug, sha).await?;
                        found.insert(sha.clone(), exists);
                    }
                }
            }
        }
        Ok(found)
    }

    /// One GraphQL request, aliasing an `object(expression: $sha)` field per
    /// SHA in the chunk so existence of many commits is checked in a single
    /// round trip.
    async fn probe_graphql(&self, slug: &str, shas: &[String]) -> Result<HashMap<String, bool>, Error> {
        let (owner, name) = split_slug(slug);
        let fields: String = shas
            .iter()
            .enumerate()
            .map(|(i, sha)| format!("c{i}: object(expression: \"{sha}\") {{ oid }}"))
            .collect::<Vec<_>>()
            .join("\n");
        let query = format!(
            "query {{ repository(owner: \"{owner}\", name: \"{name}\") {{ {fields} }} }}"
        );

        let url = self.api_base.join("graphql").into_report().change_context(Error::Request)?;
        let request = self.authenticate(self.http.post(url).json(&json!({ "query": query })))?;
        let response = request.send().await.into_report().change_context(Error::Request)?;
        self.check_rate_limit(&response)?;

        if !response.status().is_success() {
            return Err(Error::ErrorStatus)
                .into_report()
                .describe_lazy(|| format!("hosting API returned status {}", response.status()));
        }

        let body: GraphqlResponse = response.json().await.into_report().change_context(Error::ParseResponse)?;
        let mut result = HashMap::new();
        for (i, sha) in shas.iter().enumerate() {
            let key = format!("c{i}");
            let exists = body
                .data
                .as_ref()
                .and_then(|d| d.repository.get(&key))
                .map(|v| !v.is_null())
                .unwrap_or(false);
            result.insert(sha.clone(), exists);
        }
        Ok(result)
    }

    /// REST fallback for a single commit: `200` means present, `404`/`422`
    /// means absent.
    async fn probe_rest(&self, slug: &str, commit_sha: &str) -> Result<bool, Error> {
        let path = format!("repos/{slug}/commits/{commit_sha}");
        let url = self.api_base.join(&path).into_report().change_context(Error::Request)?;
        let request = self.authenticate(self.http.get(url))?;
        let response = request.send().await.into_report().change_context(Error::Request)?;
        self.check_rate_limit(&response)?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => Ok(false),
            status => Err(Error::ErrorStatus)
                .into_report()
                .describe_lazy(|| format!("hosting API returned status {status}")),
        }
    }

    /// One page of `slug`'s forks, as `owner/repo` slugs.
    async fn list_forks_page(&self, slug: &str, page: u32) -> Result<Vec<String>, Error> {
        let path = format!("repos/{slug}/forks");
        let url = self.api_base.join(&path).into_report().change_context(Error::Request)?;
        let request = self.authenticate(
            self.http
                .get(url)
                .query(&[("per_page", FORKS_PER_PAGE.to_string()), ("page", page.to_string())]),
        )?;
        let response = request.send().await.into_report().change_context(Error::Request)?;
        self.check_rate_limit(&response)?;

        if !response.status().is_success() {
            return Err(Error::ErrorStatus)
                .into_report()
                .describe_lazy(|| format!("hosting API returned status {}", response.status()));
        }

        let body: Vec<RestRepo> = response.json().await.into_report().change_context(Error::ParseResponse)?;
        Ok(body.into_iter().map(|r| r.full_name).collect())
    }

    /// Raise [`Error::RateLimited`] if the response signals rate-limit
    /// exhaustion (`403` + `X-RateLimit-Remaining: 0`).
    fn check_rate_limit(&self, response: &reqwest::Response) -> Result<(), Error> {
        if response.status() == StatusCode::FORBIDDEN {
            let remaining = response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok());
            if remaining == Some("0") {
                return Err(Error::RateLimited)
                    .into_report()
                    .describe("the configured hosting-API token pool is exhausted for this window");
            }
        }
        Ok(())
    }

    /// Find the repository containing `commit_sha`, checking the canonical
    /// repo first, then paging through its forks (bounded by `max_pages`).
    /// First hit wins.
    #[tracing::instrument(skip(self), fields(repo_slug, commit_sha, max_pages))]
    pub async fn find_commit_repo(&self, repo_slug: &str, commit_sha: &str, max_pages: u32) -> Result<Option<String>, Error> {
        if self.probe(repo_slug, commit_sha).await? {
            return Ok(Some(repo_slug.to_string()));
        }

        for page in 1..=max_pages {
            let forks = self.list_forks_page(repo_slug, page).await?;
            if forks.is_empty() {
                break;
            }
            for fork in forks {
                if self.probe(&fork, commit_sha).await? {
                    return Ok(Some(fork));
                }
            }
        }

        Ok(None)
    }

    /// Bulk variant: resolve many SHAs for one repository at once, checking
    /// the canonical repo first and then paging through forks, removing
    /// satisfied SHAs from the working set after each fork so later pages
    /// don't re-probe commits that are already resolved.
    #[tracing::instrument(skip(self, shas), fields(repo_slug, requested = shas.len(), max_pages))]
    pub async fn find_commits_across_forks(
        &self,
        repo_slug: &str,
        shas: &[String],
        max_pages: u32,
    ) -> Result<HashMap<String, String>, Error> {
        let mut remaining: Vec<String> = shas.to_vec();
        let mut resolved = HashMap::new();

        let canonical_hits = self.probe_many(repo_slug, &remaining).await?;
        remaining.retain(|sha| {
            if canonical_hits.get(sha).copied().unwrap_or(false) {
                resolved.insert(sha.clone(), repo_slug.to_string());
                false
            } else {
                true
            }
        });

        for page in 1..=max_pages {
            if remaining.is_empty() {
                break;
            }
            let forks = self.list_forks_page(repo_slug, page).await?;
            if forks.is_empty() {
                break;
            }
            for fork in forks {
                if remaining.is_empty() {
                    break;
                }
                let hits = self.probe_many(&fork, &remaining).await?;
                remaining.retain(|sha| {
                    if hits.get(sha).copied().unwrap_or(false) {
                        resolved.insert(sha.clone(), fork.clone());
                        false
                    } else {
                        true
                    }
                });
            }
        }

        Ok(resolved)
    }
}

/// Derive the git clone host for a hosting API base URL, e.g.
/// `https://api.github.com` -> `github.com`. Used to build a clone URL from
/// a discovered fork slug, since the API host and the git host commonly
/// differ on hosted platforms.
pub fn git_host(api_base: &Url) -> String {
    let host = api_base.host_str().unwrap_or("github.com");
    host.strip_prefix("api.").unwrap_or(host).to_string()
}

/// Build a git clone URL for a slug on the same host as `api_base`'s
/// corresponding git host.
pub fn to_git_url(api_base: &Url, slug: &str) -> String {
    format!("https://{}/{slug}.git", git_host(api_base))
}

fn split_slug(slug: &str) -> (&str, &str) {
    slug.split_once('/').unwrap_or((slug, ""))
}

#[derive(Debug, Deserialize)]
struct RestRepo {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<GraphqlData>,
}

#[derive(Debug, Deserialize)]
struct GraphqlData {
    repository: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_host_strips_api_prefix() {
        let base = Url::parse("https://api.github.com").unwrap();
        assert_eq!(git_host(&base), "github.com");
    }

    #[test]
    fn git_host_passes_through_when_no_api_prefix() {
        let base = Url::parse("https://git.example.com").unwrap();
        assert_eq!(git_host(&base), "git.example.com");
    }

    #[test]
    fn to_git_url_builds_expected_clone_url() {
        let base = Url::parse("https://api.github.com").unwrap();
        assert_eq!(to_git_url(&base, "other/repo"), "https://github.com/other/repo.git");
    }

    #[test]
    fn split_slug_separates_owner_and_name() {
        assert_eq!(split_slug("owner/repo"), ("owner", "repo"));
    }
}
