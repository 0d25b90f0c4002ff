//! The library module for the commit-scan scheduling and execution core.
//!
//! This crate is intended to be used in binary form, and this library may
//! exhibit breaking changes in any release. The intent for this library is
//! to support shared functionality between binaries exported by this crate,
//! along with better supporting testing.

use std::path::PathBuf;

pub mod admission;
pub mod api;
pub mod backend;
pub mod config;
pub mod db;
pub mod debug;
pub mod doc;
pub mod error_ext;
pub mod executor;
pub mod ext;
pub mod exporter;
pub mod fork_finder;
pub mod http;
pub mod ingest;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod scanner;
pub mod webhook;
pub mod worker;
pub mod worktree;

/// Shared, process-wide context constructed once at startup and threaded
/// through every component rather than relying on module-level globals.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// The root directory under which this process stores its working state:
    /// the queue, worktrees, override configs, and exported CSVs.
    data_root: PathBuf,
}

impl AppContext {
    /// Construct a new context rooted at the provided directory.
    pub fn new(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    /// The root directory for this process's working state.
    pub fn data_root(&self) -> &PathBuf {
        &self.data_root
    }
}

/// Resolve the [`AppContext`]'s data root as an owned `PathBuf`.
///
/// Named as a macro (rather than a method) to mirror call sites throughout
/// this crate that immediately `.join(...)` a subpath onto it.
#[macro_export]
macro_rules! data_dir {
    ($ctx:expr) => {
        $ctx.data_root().clone()
    };
}
