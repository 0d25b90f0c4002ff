//! Invokes the externally-configured scanner binary against a worktree, and
//! the lightweight heuristic that guesses a project's primary language
//! before invoking it.
//!
//! The scanner itself (what language-specific static analysis it performs,
//! what it uploads and how) is out of scope here: this module only knows
//! how to run a command and interpret its exit code. A non-zero exit
//! becomes `Error::Execution` carrying the combined stdout/stderr.

use std::path::Path;

use error_stack::{IntoReport, Result, ResultExt};
use walkdir::WalkDir;

use crate::ext::{
    command::{Command, OutputProvider},
    error_stack::DescribeContext,
};

/// Errors encountered invoking the scanner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Spawning or waiting on the scanner process failed.
    #[error("run scanner command")]
    Command,

    /// The scanner process exited non-zero.
    #[error("scanner exited non-zero")]
    NonZeroExit,
}

/// The outcome of a successful (zero-exit) scanner invocation.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Combined stdout the scanner produced, for inclusion in logs/dead
    /// letters on later failure (e.g. if the webhook correlation times out).
    pub stdout: String,
}

/// Invokes the scanner binary configured for this deployment.
#[derive(Debug, Clone)]
pub struct Scanner {
    binary: String,
}

impl Scanner {
    /// Construct a scanner that invokes the provided binary (a name on
    /// `PATH`, or an absolute path).
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Run the scanner against `worktree_dir`, optionally pointing it at a
    /// project-specific override config file, and tagging the run with
    /// `component_key` so the scanner can report it back to the analysis
    /// backend under that identity.
    #[tracing::instrument(skip(self), fields(component_key))]
    pub async fn scan(
        &self,
        worktree_dir: &Path,
        component_key: &str,
        override_config: Option<&Path>,
    ) -> Result<ScanOutcome, Error> {
        let mut command = Command::new(&self.binary)
            .arg_plain(format!("-Dsonar.projectKey={component_key}"))
            .current_dir(worktree_dir.to_path_buf());

        if let Some(config) = override_config {
            command = command.arg_plain(format!("-Dsonar.settings={}", config.to_string_lossy()));
        }

        let output = command.output().await.change_context(Error::Command)?;

        if !output.status().success() {
            return Err(Error::NonZeroExit)
                .into_report()
                .describe_lazy(|| format!("scanner output: {}", output.stderr_string_lossy()));
        }

        Ok(ScanOutcome {
            stdout: output.stdout_string_lossy(),
        })
    }
}

/// A coarse guess at a project's primary language, used only to select
/// scanner-side defaults; never authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    /// Predominantly Ruby source, or a `Gemfile` is present.
    Ruby,
    /// Predominantly JavaScript/TypeScript source, or a `package.json` is present.
    JavaScript,
    /// Predominantly Python source, or a `requirements.txt`/`pyproject.toml` is present.
    Python,
    /// Predominantly Java/Kotlin source, or a `pom.xml`/`build.gradle` is present.
    Jvm,
    /// No recognized manifest and no clear majority extension.
    Unknown,
}

/// Table of (manifest file -> kind); checked before falling back to
/// extension-frequency counting, since a manifest is a much stronger signal
/// than file counts when both are available.
const MANIFESTS: &[(&str, ProjectKind)] = &[
    ("Gemfile", ProjectKind::Ruby),
    ("package.json", ProjectKind::JavaScript),
    ("pyproject.toml", ProjectKind::Python),
    ("requirements.txt", ProjectKind::Python),
    ("pom.xml", ProjectKind::Jvm),
    ("build.gradle", ProjectKind::Jvm),
];

/// Extensions counted when no manifest file disambiguates the project,
/// generalizing the original's single hardcoded `*.rb` count into a small
/// table, per the distilled spec's framing of this as an explicit
/// heuristic rather than a fixed rule.
const EXTENSIONS: &[(&str, ProjectKind)] = &[
    ("rb", ProjectKind::Ruby),
    ("js", ProjectKind::JavaScript),
    ("ts", ProjectKind::JavaScript),
    ("py", ProjectKind::Python),
    ("java", ProjectKind::Jvm),
    ("kt", ProjectKind::Jvm),
];

/// Guess the primary language of a checked-out project.
///
/// First checks for a recognized manifest file at the project root; if none
/// is found, walks the tree (skipping `.git`) counting file extensions and
/// returns whichever tracked language has the most matches.
pub fn detect_project_kind(worktree_dir: &Path) -> ProjectKind {
    for (manifest, kind) in MANIFESTS {
        if worktree_dir.join(manifest).is_file() {
            return *kind;
        }
    }

    let mut counts = std::collections::HashMap::<&str, usize>::new();
    for entry in WalkDir::new(worktree_dir)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        if let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) {
            if EXTENSIONS.iter().any(|(tracked, _)| *tracked == ext) {
                *counts.entry(ext).or_default() += 1;
            }
        }
    }

    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .and_then(|(ext, _)| EXTENSIONS.iter().find(|(tracked, _)| *tracked == ext))
        .map(|(_, kind)| *kind)
        .unwrap_or(ProjectKind::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ruby_via_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("Gemfile"), "source 'https://rubygems.org'").unwrap();
        assert_eq!(detect_project_kind(dir.path()), ProjectKind::Ruby);
    }

    #[test]
    fn detects_majority_extension_without_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.py"), "").unwrap();
        std::fs::write(dir.path().join("b.py"), "").unwrap();
        std::fs::write(dir.path().join("c.js"), "").unwrap();
        assert_eq!(detect_project_kind(dir.path()), ProjectKind::Python);
    }

    #[test]
    fn unknown_when_nothing_recognized() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        assert_eq!(detect_project_kind(dir.path()), ProjectKind::Unknown);
    }
}
