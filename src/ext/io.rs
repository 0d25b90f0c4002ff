//! Helpers for running blocking IO on Tokio's background thread pool.
//!
//! # Async implementation
//!
//! These functions generally consist of an async wrapper around
//! synchronously executed blocking functions (these are run in a background worker thread).
//!
//! [^note]: Tokio has a lot of optimizations in place to maximize background threadpool reuse,
//! but still any call to `spawn_blocking` _may_ result in a spawned thread.

use error_stack::{Context, IntoReport, Report, ResultExt};
use tokio::task;

/// Errors that are possibly surfaced during IO actions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error occurred in the underlying IO layer.
    #[error("IO layer error")]
    IO,

    /// Failed to join the background worker that performed the backing IO operation.
    #[error("join background worker")]
    JoinWorker,
}

/// Run the provided blocking closure in the background.
#[tracing::instrument(skip_all)]
async fn run_background<T, E, F>(work: F) -> Result<T, Report<Error>>
where
    T: Send + 'static,
    E: Context,
    F: FnOnce() -> Result<T, Report<E>> + Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .context(Error::JoinWorker)
        .describe("this process runs some IO actions in a background thread, and that thread was unable to be synchronized with the caller")
        .help("this is unlikely to be resolvable by an end user, although it may be environmental; try restarting the process")?
        .change_context(Error::IO)
}

/// Run the provided blocking closure in the background,
/// wrapping any error returned in this module's `Error::IO` context.
#[tracing::instrument(skip_all)]
pub async fn spawn_blocking<T, E, F>(work: F) -> Result<T, Report<Error>>
where
    T: Send + 'static,
    E: std::error::Error + Sync + Send + 'static,
    Report<E>: From<E>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    spawn_blocking_stacked(|| work().into_report()).await
}

/// Run the provided blocking closure in the background,
/// wrapping any error returned in this module's `Error::IO` context.
#[tracing::instrument(skip_all)]
pub async fn spawn_blocking_stacked<T, E, F>(work: F) -> Result<T, Report<Error>>
where
    T: Send + 'static,
    E: Context,
    F: FnOnce() -> Result<T, Report<E>> + Send + 'static,
{
    run_background(|| work()).await
}
