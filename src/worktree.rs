//! Manages per-`(backend, project)` clones and the disposable per-commit
//! worktrees checked out of them.
//!
//! The original spec's access pattern ("many commits, same repo, over and
//! over") is exactly what `git worktree` exists for: clone a project's
//! object store exactly once per backend, then produce cheap disposable
//! checkouts of individual commits that share it, instead of re-cloning (or
//! keeping many full checkouts) per commit. Subprocess invocation follows
//! [`crate::ext::command::Command`]'s pattern for secret redaction; the
//! advisory per-repo lock follows `fs2`, the same file-locking primitive
//! `yaque` itself uses for its send/recv locks.

use std::path::{Path, PathBuf};

use error_stack::{IntoReport, Result, ResultExt};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::ext::{
    command::{Command, OutputProvider},
    error_stack::{DescribeContext, ErrorHelper},
};

/// Errors encountered managing worktrees.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating a directory under the data root failed.
    #[error("create directory")]
    CreateDirectory,

    /// Acquiring the advisory per-repo lock failed.
    #[error("acquire repo lock")]
    AcquireLock,

    /// A `git` invocation exited non-zero.
    #[error("run git command")]
    GitCommand,

    /// The requested commit is absent from the primary remote, and either no
    /// fallback remote was provided or the fallback remote didn't have it
    /// either. Distinct from [`Error::GitCommand`] so callers can tell "the
    /// commit just isn't there" apart from "git itself is broken", since only
    /// the former is a signal to go try fork discovery.
    #[error("commit not found in origin or fallback remote")]
    CommitMissing,

    /// Writing a content-addressed override config file failed.
    #[error("write override config")]
    WriteOverrideConfig,
}

/// Manages clones and worktrees under one data root.
///
/// Directory layout (relative to the data root):
/// ```text
/// worktrees/<backend>/<project_key>/repo/        # the shared bare-ish clone + its .repo.lock
/// worktrees/<backend>/<project_key>/commits/<sha>/  # one worktree per checked-out commit
/// configs/<sha256>.json                          # content-addressed override configs
/// ```
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    data_root: PathBuf,
}

impl WorktreeManager {
    /// Construct a manager rooted at the provided data directory.
    pub fn new(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    /// The directory the shared clone for `(backend, project_key)` lives in.
    fn repo_dir(&self, backend: &str, project_key: &str) -> PathBuf {
        self.data_root
            .join("worktrees")
            .join(sanitize(backend))
            .join(sanitize(project_key))
            .join("repo")
    }

    /// The directory an individual commit's worktree is checked out into.
    fn commit_dir(&self, backend: &str, project_key: &str, commit_sha: &str) -> PathBuf {
        self.data_root
            .join("worktrees")
            .join(sanitize(backend))
            .join(sanitize(project_key))
            .join("commits")
            .join(commit_sha)
    }

    /// Path to the advisory lock file guarding `(backend, project_key)`.
    ///
    /// One worker at a time may hold this lock; it serializes clone/fetch
    /// and worktree add/remove operations against the shared repo directory.
    fn lock_path(&self, backend: &str, project_key: &str) -> PathBuf {
        self.data_root
            .join("worktrees")
            .join(sanitize(backend))
            .join(sanitize(project_key))
            .join(".repo.lock")
    }

    /// Check out `commit_sha` of `repo_url` as a disposable worktree,
    /// cloning the shared repo and fetching the commit first if needed.
    ///
    /// If the commit is absent from `repo_url` and `fork_remote` is
    /// provided, a temporary `fork` remote pointing at it is added, fetched
    /// from, and removed. Returns
    /// [`Error::CommitMissing`] if the commit is absent even after trying
    /// the fallback (or if no fallback was provided) — callers should treat
    /// that distinctly from other git failures, since it's the signal to
    /// either give up permanently or escalate to the fuller fork-discovery
    /// search in [`crate::fork_finder`] and call this again with the result.
    ///
    /// The whole operation (clone/fetch/fallback-fetch/worktree-add) runs
    /// under one acquisition of the per-`(backend, project)` exclusive lock,
    /// matching the invariant that the lock is held across steps 1-4 of
    /// §4.2 but never during the scan itself.
    ///
    /// Returns the path to the checked-out worktree. The caller is
    /// responsible for calling [`Self::remove_worktree`] once done with it.
    #[tracing::instrument(skip(self), fields(backend, project_key, commit_sha))]
    pub async fn checkout_commit(
        &self,
        backend: &str,
        project_key: &str,
        repo_url: &str,
        commit_sha: &str,
        fork_remote: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let repo_dir = self.repo_dir(backend, project_key);
        let lock_path = self.lock_path(backend, project_key);
        tokio::fs::create_dir_all(lock_path.parent().expect("lock path always has a parent"))
            .await
            .into_report()
            .change_context(Error::CreateDirectory)
            .describe_lazy(|| format!("create parent directory for {lock_path:?}"))?;

        let lock_file = std::fs::File::create(&lock_path)
            .into_report()
            .change_context(Error::AcquireLock)
            .describe_lazy(|| format!("open lock file {lock_path:?}"))?;

        // `fs2`'s lock is OS-level (`flock`) so it holds across worker
        // processes, not just within this one; it's released automatically
        // when `lock_file` drops at the end of this function.
        lock_file
            .lock_exclusive()
            .into_report()
            .change_context(Error::AcquireLock)
            .describe_lazy(|| format!("acquire exclusive lock on {lock_path:?}"))
            .help("another worker is holding the lock for this repository; this is expected under load and the lock will be released once that worker is done")?;

        self.ensure_clone(&repo_dir, repo_url).await?;
        self.sync_remote_url(&repo_dir, repo_url).await?;

        if !self.commit_exists(&repo_dir, commit_sha).await? {
            self.fetch_origin(&repo_dir, commit_sha).await.ok();
        }
        if !self.commit_exists(&repo_dir, commit_sha).await? {
            if let Some(fork_remote) = fork_remote {
                self.fetch_from_remote(&repo_dir, "fork", fork_remote, commit_sha).await.ok();
            }
        }
        if !self.commit_exists(&repo_dir, commit_sha).await? {
            return Err(Error::CommitMissing)
                .into_report()
                .describe_lazy(|| format!("commit '{commit_sha}' absent from '{repo_url}'"));
        }

        let commit_dir = self.commit_dir(backend, project_key, commit_sha);
        if commit_dir.exists() {
            debug!("worktree for commit already exists, reusing");
        } else {
            self.add_worktree(&repo_dir, &commit_dir, commit_sha).await?;
        }

        Ok(commit_dir)
    }

    /// Update the primary clone's `origin` remote, in case upstream slug
    /// rewriting changed it since the clone was created.
    async fn sync_remote_url(&self, repo_dir: &Path, repo_url: &str) -> Result<(), Error> {
        let output = Command::new("git")
            .arg_plain("remote")
            .arg_plain("set-url")
            .arg_plain("origin")
            .arg_plain(repo_url.to_string())
            .current_dir(repo_dir.to_path_buf())
            .output()
            .await
            .change_context(Error::GitCommand)?;

        if !output.status().success() {
            return Err(Error::GitCommand)
                .into_report()
                .describe_lazy(|| format!("git remote set-url exited non-zero: {}", output.stderr_string_lossy()));
        }
        Ok(())
    }

    /// Whether `commit_sha` is present in the local object store.
    async fn commit_exists(&self, repo_dir: &Path, commit_sha: &str) -> Result<bool, Error> {
        let check = Command::new("git")
            .arg_plain("cat-file")
            .arg_plain("-e")
            .arg_plain(format!("{commit_sha}^{{commit}}"))
            .current_dir(repo_dir.to_path_buf())
            .output()
            .await
            .change_context(Error::GitCommand)?;
        Ok(check.status().success())
    }

    /// Fetch all refs from `origin`, with prune, then attempt to fetch the
    /// specific commit directly (cheaper than a full prune fetch when the
    /// commit is reachable but not under any ref, e.g. a force-pushed-over
    /// branch tip).
    async fn fetch_origin(&self, repo_dir: &Path, commit_sha: &str) -> Result<(), Error> {
        debug!("commit not present locally, fetching from origin");
        let output = Command::new("git")
            .arg_plain("fetch")
            .arg_plain("--filter=blob:none")
            .arg_plain("--prune")
            .arg_plain("origin")
            .env_plain("GIT_TERMINAL_PROMPT", "0")
            .current_dir(repo_dir.to_path_buf())
            .output()
            .await
            .change_context(Error::GitCommand)?;

        if !output.status().success() {
            return Err(Error::GitCommand)
                .into_report()
                .describe_lazy(|| format!("git fetch --prune exited non-zero: {}", output.stderr_string_lossy()));
        }

        self.fetch_from_remote(repo_dir, "origin", "", commit_sha).await
    }

    /// Fetch a specific commit from a named remote. If `remote` isn't
    /// already configured and `url` is non-empty, it's added first and
    /// removed again once the fetch attempt completes, win or lose.
    async fn fetch_from_remote(&self, repo_dir: &Path, remote: &str, url: &str, commit_sha: &str) -> Result<(), Error> {
        let added = if !url.is_empty() {
            let add = Command::new("git")
                .arg_plain("remote")
                .arg_plain("add")
                .arg_plain(remote.to_string())
                .arg_plain(url.to_string())
                .current_dir(repo_dir.to_path_buf())
                .output()
                .await
                .change_context(Error::GitCommand)?;
            add.status().success()
        } else {
            false
        };

        let fetch = Command::new("git")
            .arg_plain("fetch")
            .arg_plain("--filter=blob:none")
            .arg_plain(remote.to_string())
            .arg_plain(commit_sha.to_string())
            .env_plain("GIT_TERMINAL_PROMPT", "0")
            .current_dir(repo_dir.to_path_buf())
            .output()
            .await
            .change_context(Error::GitCommand)?;

        if added {
            // Best-effort: a failure here shouldn't mask the fetch result.
            let _ = Command::new("git")
                .arg_plain("remote")
                .arg_plain("remove")
                .arg_plain(remote.to_string())
                .current_dir(repo_dir.to_path_buf())
                .output()
                .await;
        }

        if !fetch.status().success() {
            return Err(Error::GitCommand)
                .into_report()
                .describe_lazy(|| format!("git fetch from '{remote}' exited non-zero: {}", fetch.stderr_string_lossy()));
        }
        Ok(())
    }

    /// Remove a previously checked-out commit's worktree.
    ///
    /// Idempotent: calling this for a worktree that was already removed (or
    /// never created) is not an error.
    #[tracing::instrument(skip(self), fields(backend, project_key, commit_sha))]
    pub async fn remove_worktree(
        &self,
        backend: &str,
        project_key: &str,
        commit_sha: &str,
    ) -> Result<(), Error> {
        let repo_dir = self.repo_dir(backend, project_key);
        let commit_dir = self.commit_dir(backend, project_key, commit_sha);
        if !commit_dir.exists() {
            return Ok(());
        }

        let output = Command::new("git")
            .arg_plain("worktree")
            .arg_plain("remove")
            .arg_plain("--force")
            .arg_plain(commit_dir.to_string_lossy().to_string())
            .current_dir(repo_dir)
            .output()
            .await
            .change_context(Error::GitCommand)?;

        if !output.status().success() {
            return Err(Error::GitCommand)
                .into_report()
                .describe_lazy(|| format!("git worktree remove exited non-zero: {}", output.stderr_string_lossy()));
        }

        Ok(())
    }

    /// Clone the shared repo if it doesn't already exist locally.
    async fn ensure_clone(&self, repo_dir: &Path, repo_url: &str) -> Result<(), Error> {
        if repo_dir.join("HEAD").exists() || repo_dir.join(".git").exists() {
            return Ok(());
        }

        tokio::fs::create_dir_all(repo_dir.parent().expect("repo dir always has a parent"))
            .await
            .into_report()
            .change_context(Error::CreateDirectory)?;

        info!("cloning repository into shared worktree store");
        let output = Command::new("git")
            .arg_plain("clone")
            .arg_plain("--filter=blob:none")
            .arg_plain("--no-checkout")
            .arg_plain(repo_url.to_string())
            .arg_plain(repo_dir.to_string_lossy().to_string())
            .env_plain("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .change_context(Error::GitCommand)?;

        if !output.status().success() {
            return Err(Error::GitCommand)
                .into_report()
                .describe_lazy(|| format!("git clone exited non-zero: {}", output.stderr_string_lossy()))
                .help("verify that the repo URL is reachable and that any required credentials are embedded in it");
        }

        Ok(())
    }

    /// Add a new worktree checked out at `commit_sha`, detached.
    async fn add_worktree(&self, repo_dir: &Path, commit_dir: &Path, commit_sha: &str) -> Result<(), Error> {
        tokio::fs::create_dir_all(commit_dir.parent().expect("commit dir always has a parent"))
            .await
            .into_report()
            .change_context(Error::CreateDirectory)?;

        let output = Command::new("git")
            .arg_plain("worktree")
            .arg_plain("add")
            .arg_plain("--detach")
            .arg_plain("--force")
            .arg_plain(commit_dir.to_string_lossy().to_string())
            .arg_plain(commit_sha.to_string())
            .current_dir(repo_dir.to_path_buf())
            .output()
            .await
            .change_context(Error::GitCommand)?;

        if !output.status().success() {
            return Err(Error::GitCommand)
                .into_report()
                .describe_lazy(|| format!("git worktree add exited non-zero: {}", output.stderr_string_lossy()));
        }

        Ok(())
    }

    /// Content-address an override config blob by its sha256 digest, writing
    /// it to `configs/<digest>.json` if it doesn't already exist.
    ///
    /// Write-once: since the filename is derived from the content itself,
    /// an existing file with that name is guaranteed to already hold this
    /// exact content, so concurrent callers racing to write the same
    /// override never need to coordinate.
    #[tracing::instrument(skip(self, content))]
    pub async fn ensure_override_config(&self, content: &[u8]) -> Result<PathBuf, Error> {
        let digest = Sha256::digest(content);
        let name = format!("{digest:x}.json");
        let configs_dir = self.data_root.join("configs");
        tokio::fs::create_dir_all(&configs_dir)
            .await
            .into_report()
            .change_context(Error::CreateDirectory)?;

        let path = configs_dir.join(name);
        if path.exists() {
            return Ok(path);
        }

        tokio::fs::write(&path, content)
            .await
            .into_report()
            .change_context(Error::WriteOverrideConfig)
            .describe_lazy(|| format!("write override config to {path:?}"))?;

        Ok(path)
    }
}

/// Replace path separators in user-controlled identifiers so they can't
/// escape the directories they're joined into.
fn sanitize(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize("owner/repo"), "owner_repo");
        assert_eq!(sanitize("plain"), "plain");
    }

    #[tokio::test]
    async fn ensure_override_config_is_write_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(dir.path().to_path_buf());

        let path_a = manager
            .ensure_override_config(br#"{"exclude":["vendor/**"]}"#)
            .await
            .expect("first write succeeds");
        let path_b = manager
            .ensure_override_config(br#"{"exclude":["vendor/**"]}"#)
            .await
            .expect("second write with identical content succeeds");

        assert_eq!(path_a, path_b, "identical content must content-address to the same path");

        let path_c = manager
            .ensure_override_config(br#"{"exclude":["node_modules/**"]}"#)
            .await
            .expect("different content succeeds");
        assert_ne!(path_a, path_c, "different content must content-address to different paths");
    }

    #[test]
    fn repo_and_commit_dirs_are_distinct_per_backend() {
        let manager = WorktreeManager::new(PathBuf::from("/tmp/data-root"));
        let a = manager.repo_dir("backend-a", "owner/repo");
        let b = manager.repo_dir("backend-b", "owner/repo");
        assert_ne!(a, b, "different backends must not share a clone directory");
    }

    /// Run a `git` command against a local directory, for test fixture setup.
    async fn run_git(dir: &Path, args: &[&str]) {
        let mut command = Command::new("git");
        for arg in args {
            command = command.arg_plain(arg.to_string());
        }
        let output = command
            .current_dir(dir.to_path_buf())
            .output()
            .await
            .expect("spawn git");
        assert!(output.status().success(), "git {:?} failed: {}", args, output.stderr_string_lossy());
    }

    #[tokio::test]
    async fn checkout_commit_falls_back_to_fork_remote_when_commit_missing_from_origin() {
        let root = tempfile::tempdir().expect("tempdir");

        let origin = root.path().join("origin");
        tokio::fs::create_dir_all(&origin).await.expect("mkdir origin");
        run_git(&origin, &["init", "--initial-branch=main"]).await;
        run_git(&origin, &["config", "user.email", "test@example.com"]).await;
        run_git(&origin, &["config", "user.name", "test"]).await;
        tokio::fs::write(origin.join("a.txt"), b"a").await.expect("write a.txt");
        run_git(&origin, &["add", "."]).await;
        run_git(&origin, &["commit", "-m", "origin commit"]).await;

        let fork = root.path().join("fork");
        run_git(&root.path().to_path_buf(), &["clone", origin.to_str().unwrap(), fork.to_str().unwrap()]).await;
        tokio::fs::write(fork.join("b.txt"), b"b").await.expect("write b.txt");
        run_git(&fork, &["add", "."]).await;
        run_git(&fork, &["commit", "-m", "fork-only commit"]).await;

        let fork_head_output = {
            let mut command = Command::new("git");
            command = command.arg_plain("rev-parse".to_string()).arg_plain("HEAD".to_string());
            command.current_dir(fork.clone()).output().await.expect("rev-parse")
        };
        let fork_head = fork_head_output.stdout_string_lossy().trim().to_string();

        let data_root = root.path().join("data");
        let manager = WorktreeManager::new(data_root);

        let origin_url = format!("file://{}", origin.display());
        let fork_url = format!("file://{}", fork.display());

        let without_fallback = manager
            .checkout_commit("sonarqube", "owner/repo", &origin_url, &fork_head, None)
            .await;
        assert!(
            matches!(without_fallback, Err(ref report) if matches!(report.current_context(), Error::CommitMissing)),
            "a fork-only commit must be reported missing when no fallback remote is given"
        );

        let worktree_dir = manager
            .checkout_commit("sonarqube", "owner/repo", &origin_url, &fork_head, Some(&fork_url))
            .await
            .expect("checkout succeeds once the fork remote is supplied");

        assert!(worktree_dir.join("b.txt").exists(), "checked-out worktree must contain the fork-only file");
    }
}
