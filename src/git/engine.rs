// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git operations against the workspace clone.
//!
//! Every operation shells out to the `git` binary through one helper and
//! returns a structured outcome. Credentials are injected per invocation
//! through an inline credential helper reading an environment variable, so
//! the token never touches the repository config on disk.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::GitError;

/// Inline credential helper; resolves the password from the environment of
/// the git invocation itself.
const CREDENTIAL_HELPER: &str =
    r#"!f() { echo "username=x-access-token"; echo "password=${EDITD_GIT_TOKEN}"; }; f"#;

/// How a push eventually landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStrategy {
    /// The straight push was accepted.
    FastForward,
    /// The remote had advanced; a clean rebase reconciled it.
    Rebased,
    /// The rebase conflicted; a merge with ours-wins resolution landed.
    MergedOurs,
}

/// Result of a branch switch.
#[derive(Debug, Clone, Default)]
pub struct SwitchReport {
    /// A new local branch was created.
    pub created_branch: bool,
    /// Uncommitted changes were parked in a stash before the switch.
    pub stashed: bool,
    /// The stash could not be re-applied cleanly and was left in the
    /// stash list for a later instruction to resolve.
    pub stash_kept: bool,
}

/// Result of conflict auto-resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// No unmerged paths were present.
    NothingToDo,
    /// This many paths were resolved to the local version and committed.
    Resolved(usize),
}

/// Result of a commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A commit was created.
    Committed { sha: String },
    /// The tree was clean.
    NothingToCommit,
}

impl CommitOutcome {
    /// The new commit sha, if one was created.
    pub fn sha(&self) -> Option<&str> {
        match self {
            Self::Committed { sha } => Some(sha),
            Self::NothingToCommit => None,
        }
    }
}

/// Git engine bound to one workspace directory.
pub struct GitEngine {
    workdir: PathBuf,
    token: String,
    committer_name: String,
    committer_email: String,
    push_retry_count: u32,
}

impl GitEngine {
    /// Create an engine for the given workspace directory.
    pub fn new(
        workdir: impl Into<PathBuf>,
        token: impl Into<String>,
        committer_name: impl Into<String>,
        committer_email: impl Into<String>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            token: token.into(),
            committer_name: committer_name.into(),
            committer_email: committer_email.into(),
            push_retry_count: 3,
        }
    }

    /// Set the transient-failure retry budget for pushes.
    pub fn with_push_retries(mut self, count: u32) -> Self {
        self.push_retry_count = count;
        self
    }

    /// The workspace directory this engine operates on.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run a git command in the workspace and return stdout.
    async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        self.git_in(&self.workdir, args).await
    }

    /// Run a git command in an arbitrary directory and return stdout.
    async fn git_in(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .arg("-c")
            .arg(format!("credential.helper={CREDENTIAL_HELPER}"))
            .args(args)
            .current_dir(dir)
            .env("EDITD_GIT_TOKEN", &self.token)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            Err(GitError::from_command(
                args.first().copied().unwrap_or("git"),
                stderr,
            ))
        }
    }

    /// Idempotently make sure the workspace holds a usable clone of
    /// `repo_url` with committer identity configured.
    pub async fn ensure_repo(&self, repo_url: &str) -> Result<(), GitError> {
        if self.workdir.join(".git").exists() {
            debug!(workdir = %self.workdir.display(), "Reusing existing clone");
        } else {
            let parent = self
                .workdir
                .parent()
                .ok_or_else(|| GitError::NotARepo(self.workdir.display().to_string()))?;
            std::fs::create_dir_all(parent)?;
            let target = self.workdir.to_string_lossy().to_string();
            info!(repo_url, workdir = %target, "Cloning workspace");
            self.git_in(parent, &["clone", "--depth", "1", repo_url, &target])
                .await?;
        }

        self.git(&["config", "user.name", &self.committer_name])
            .await?;
        self.git(&["config", "user.email", &self.committer_email])
            .await?;
        Ok(())
    }

    /// Whether the working tree has uncommitted changes (tracked or
    /// untracked).
    pub async fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.git(&["status", "--porcelain"]).await?.is_empty())
    }

    /// Paths with uncommitted changes, untracked files included.
    pub async fn changed_paths(&self) -> Result<Vec<String>, GitError> {
        let status = self.git(&["status", "--porcelain"]).await?;
        Ok(status
            .lines()
            .filter_map(|line| line.get(3..))
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .collect())
    }

    /// The current branch name.
    pub async fn current_branch(&self) -> Result<String, GitError> {
        self.git(&["branch", "--show-current"]).await
    }

    /// The sha of HEAD.
    pub async fn head_sha(&self) -> Result<String, GitError> {
        self.git(&["rev-parse", "HEAD"]).await
    }

    /// Check if a branch exists locally.
    async fn branch_exists(&self, branch: &str) -> bool {
        self.git(&["rev-parse", "--verify", "--quiet", branch])
            .await
            .is_ok()
    }

    /// Check if a branch exists on the remote.
    async fn remote_branch_exists(&self, branch: &str) -> bool {
        self.git(&["ls-remote", "--exit-code", "--heads", "origin", branch])
            .await
            .is_ok()
    }

    /// Switch to `target`, preserving any uncommitted changes.
    ///
    /// Pre-call changes survive in exactly one of three places: committed
    /// on the original branch (not this op's business), re-applied on the
    /// target branch, or parked in a named stash entry. Nothing is ever
    /// silently dropped.
    pub async fn safe_switch(&self, target: &str) -> Result<SwitchReport, GitError> {
        let mut report = SwitchReport::default();
        let label = format!("auto-stash before switching to {target}");

        if self.is_dirty().await? {
            self.git(&["stash", "push", "--include-untracked", "-m", &label])
                .await?;
            report.stashed = true;
            debug!(target, "Stashed uncommitted changes before switch");
        }

        if let Err(err) = self.checkout_or_create(target, &mut report).await {
            // The stash entry, if any, stays in the list.
            warn!(target, error = %err, "Branch switch failed");
            return Err(err);
        }

        if report.stashed {
            match self.git(&["stash", "apply"]).await {
                Ok(_) => {
                    self.git(&["stash", "drop"]).await?;
                }
                Err(err) => {
                    // Conflicting application: back the partial merge out
                    // and keep the entry for a later instruction.
                    warn!(target, error = %err, "Stash re-apply conflicted; keeping stash entry");
                    let _ = self.git(&["reset", "--hard", "HEAD"]).await;
                    report.stash_kept = true;
                }
            }
        }

        Ok(report)
    }

    async fn checkout_or_create(
        &self,
        target: &str,
        report: &mut SwitchReport,
    ) -> Result<(), GitError> {
        if self.branch_exists(target).await {
            self.git(&["checkout", target]).await?;
        } else if self.remote_branch_exists(target).await {
            // Shallow clones track a single branch; fetch with an explicit
            // refspec so the remote-tracking ref exists.
            let refspec = format!("+refs/heads/{target}:refs/remotes/origin/{target}");
            self.git(&["fetch", "origin", &refspec]).await?;
            let upstream = format!("origin/{target}");
            self.git(&["checkout", "-b", target, &upstream]).await?;
            report.created_branch = true;
        } else {
            self.git(&["checkout", "-b", target]).await?;
            report.created_branch = true;
        }
        Ok(())
    }

    /// Adopt the local version of every unmerged path and commit the
    /// resolution.
    pub async fn resolve_conflicts_ours(&self) -> Result<ResolveOutcome, GitError> {
        let unmerged = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        if unmerged.is_empty() {
            return Ok(ResolveOutcome::NothingToDo);
        }

        let paths: Vec<&str> = unmerged.lines().collect();
        for path in paths.iter().copied() {
            // `checkout --ours` fails when our side deleted the path; the
            // local version then is the deletion.
            if self.git(&["checkout", "--ours", "--", path]).await.is_ok() {
                self.git(&["add", "--", path]).await?;
            } else {
                let _ = self.git(&["rm", "--force", "--quiet", "--", path]).await;
            }
        }

        self.git(&["commit", "-m", "Auto-resolve merge conflicts (ours)"])
            .await?;
        info!(count = paths.len(), "Auto-resolved conflicts toward local versions");
        Ok(ResolveOutcome::Resolved(paths.len()))
    }

    /// Stage everything and create one commit, if the tree is dirty.
    pub async fn commit_if_dirty(
        &self,
        subject: &str,
        body: Option<&str>,
    ) -> Result<CommitOutcome, GitError> {
        self.git(&["add", "-A"]).await?;
        if self.git(&["status", "--porcelain"]).await?.is_empty() {
            return Ok(CommitOutcome::NothingToCommit);
        }

        match body {
            Some(body) => self.git(&["commit", "-m", subject, "-m", body]).await?,
            None => self.git(&["commit", "-m", subject]).await?,
        };
        let sha = self.head_sha().await?;
        debug!(%sha, subject, "Created commit");
        Ok(CommitOutcome::Committed { sha })
    }

    /// Push `branch`, recovering from divergent remotes.
    ///
    /// Straight push first; on a non-fast-forward rejection, rebase onto
    /// the remote, and if the rebase conflicts, fall back to a merge with
    /// ours-wins resolution. Never force-pushes.
    pub async fn safe_push(&self, branch: &str) -> Result<PushStrategy, GitError> {
        match self.push_with_retries(branch).await {
            Ok(()) => return Ok(PushStrategy::FastForward),
            Err(err) if err.is_auth() => return Err(err),
            Err(err) if !is_rejected_push(&err) => return Err(err),
            Err(_) => debug!(branch, "Push rejected; remote has diverged"),
        }

        match self.git(&["pull", "--rebase", "origin", branch]).await {
            Ok(_) => {
                self.push_with_retries(branch).await?;
                return Ok(PushStrategy::Rebased);
            }
            Err(err) if err.is_auth() => return Err(err),
            Err(err) => {
                debug!(branch, error = %err, "Rebase failed; falling back to merge");
                let _ = self.git(&["rebase", "--abort"]).await;
            }
        }

        let merged = self.git(&["pull", "--no-rebase", "origin", branch]).await;
        let resolved = self.resolve_conflicts_ours().await?;
        if let Err(err) = merged {
            if resolved == ResolveOutcome::NothingToDo {
                // The pull failed for some reason other than conflicts.
                return Err(err);
            }
        }
        self.push_with_retries(branch).await?;
        Ok(PushStrategy::MergedOurs)
    }

    async fn push_with_retries(&self, branch: &str) -> Result<(), GitError> {
        let mut attempt = 0u32;
        loop {
            match self.git(&["push", "-u", "origin", branch]).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.push_retry_count => {
                    attempt += 1;
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(branch, attempt, error = %err, "Transient push failure; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Best-effort cleanup of any in-progress merge, rebase, or
    /// cherry-pick; hard-resets if unmerged paths remain afterwards.
    pub async fn recover(&self) -> Result<(), GitError> {
        for abort in [
            ["merge", "--abort"],
            ["rebase", "--abort"],
            ["cherry-pick", "--abort"],
        ] {
            let _ = self.git(&abort).await;
        }

        let unmerged = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap_or_default();
        if !unmerged.is_empty() {
            warn!("Unmerged paths survived aborts; hard-resetting to HEAD");
            let _ = self.git(&["reset", "--hard", "HEAD"]).await;
        }
        Ok(())
    }

    /// Names of entries currently in the stash list.
    pub async fn stash_entries(&self) -> Result<Vec<String>, GitError> {
        let list = self.git(&["stash", "list"]).await?;
        Ok(list.lines().map(|l| l.to_string()).collect())
    }
}

/// Whether a push failure is the remote refusing a non-fast-forward.
fn is_rejected_push(err: &GitError) -> bool {
    match err {
        GitError::Command { stderr, .. } => {
            let lower = stderr.to_lowercase();
            lower.contains("non-fast-forward")
                || lower.contains("fetch first")
                || lower.contains("[rejected]")
                || lower.contains("failed to push some refs")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn run(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    async fn init_repo(dir: &Path) {
        run(dir, &["init", "--initial-branch=main"]).await;
        run(dir, &["config", "user.name", "Test"]).await;
        run(dir, &["config", "user.email", "test@example.com"]).await;
        std::fs::write(dir.join("index.md"), "hello\n").unwrap();
        run(dir, &["add", "-A"]).await;
        run(dir, &["commit", "-m", "init"]).await;
    }

    fn engine(dir: &Path) -> GitEngine {
        GitEngine::new(dir, "", "Edit Worker", "editd@localhost")
    }

    #[tokio::test]
    async fn test_safe_switch_creates_branch() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let git = engine(tmp.path());

        let report = git.safe_switch("thread-abc").await.unwrap();
        assert!(report.created_branch);
        assert!(!report.stashed);
        assert_eq!(git.current_branch().await.unwrap(), "thread-abc");
    }

    #[tokio::test]
    async fn test_safe_switch_preserves_dirty_tree() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let git = engine(tmp.path());

        std::fs::write(tmp.path().join("index.md"), "edited\n").unwrap();
        let report = git.safe_switch("thread-def").await.unwrap();
        assert!(report.stashed);
        assert!(!report.stash_kept);

        // The edit travelled to the new branch; the stash was consumed.
        let content = std::fs::read_to_string(tmp.path().join("index.md")).unwrap();
        assert_eq!(content, "edited\n");
        assert!(git.stash_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_safe_switch_keeps_conflicting_stash() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let git = engine(tmp.path());

        // Branch with committed content that will conflict.
        git.safe_switch("thread-x").await.unwrap();
        std::fs::write(tmp.path().join("index.md"), "theirs\n").unwrap();
        git.commit_if_dirty("On thread-x", None).await.unwrap();
        run(tmp.path(), &["checkout", "main"]).await;

        // Dirty edit on main that conflicts with thread-x's version.
        std::fs::write(tmp.path().join("index.md"), "mine\n").unwrap();
        let report = git.safe_switch("thread-x").await.unwrap();
        assert!(report.stashed);
        assert!(report.stash_kept);

        // Tree is clean on the target branch, the change is parked.
        assert!(!git.is_dirty().await.unwrap());
        let stashes = git.stash_entries().await.unwrap();
        assert_eq!(stashes.len(), 1);
        assert!(stashes[0].contains("auto-stash before switching to thread-x"));
    }

    #[tokio::test]
    async fn test_commit_if_dirty() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let git = engine(tmp.path());

        assert_eq!(
            git.commit_if_dirty("Nothing", None).await.unwrap(),
            CommitOutcome::NothingToCommit
        );

        std::fs::write(tmp.path().join("new.md"), "content\n").unwrap();
        let outcome = git
            .commit_if_dirty("Add new page", Some("Body text"))
            .await
            .unwrap();
        let sha = outcome.sha().unwrap();
        assert_eq!(sha.len(), 40);

        let subject = run(tmp.path(), &["log", "-1", "--format=%s"]).await;
        assert_eq!(subject, "Add new page");
    }

    #[tokio::test]
    async fn test_changed_paths_lists_untracked() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let git = engine(tmp.path());

        std::fs::write(tmp.path().join("a.md"), "a\n").unwrap();
        std::fs::write(tmp.path().join("index.md"), "changed\n").unwrap();
        let mut paths = git.changed_paths().await.unwrap();
        paths.sort();
        assert_eq!(paths, vec!["a.md", "index.md"]);
    }

    #[tokio::test]
    async fn test_ensure_repo_clones_and_reuses() {
        let tmp = TempDir::new().unwrap();
        let upstream = tmp.path().join("upstream");
        std::fs::create_dir(&upstream).unwrap();
        init_repo(&upstream).await;
        let url = format!("file://{}", upstream.display());

        let workdir = tmp.path().join("project").join("user").join("upstream");
        let git = engine(&workdir);
        git.ensure_repo(&url).await.unwrap();
        assert!(workdir.join(".git").exists());
        assert!(workdir.join("index.md").exists());

        // Second call reuses the clone.
        git.ensure_repo(&url).await.unwrap();
        assert_eq!(git.current_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn test_safe_push_fast_forward() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        std::fs::create_dir(&remote).unwrap();
        run(&remote, &["init", "--bare", "--initial-branch=main"]).await;

        let work = tmp.path().join("work");
        std::fs::create_dir(&work).unwrap();
        init_repo(&work).await;
        run(&work, &["remote", "add", "origin", remote.to_str().unwrap()]).await;

        let git = engine(&work);
        let strategy = git.safe_push("main").await.unwrap();
        assert_eq!(strategy, PushStrategy::FastForward);
    }

    #[tokio::test]
    async fn test_safe_push_recovers_from_divergence() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        std::fs::create_dir(&remote).unwrap();
        run(&remote, &["init", "--bare", "--initial-branch=main"]).await;
        let remote_url = remote.to_str().unwrap().to_string();

        let ours = tmp.path().join("ours");
        std::fs::create_dir(&ours).unwrap();
        init_repo(&ours).await;
        run(&ours, &["remote", "add", "origin", &remote_url]).await;
        run(&ours, &["push", "-u", "origin", "main"]).await;

        // A second clone advances the remote with a non-conflicting file.
        let theirs = tmp.path().join("theirs");
        run(tmp.path(), &["clone", &remote_url, theirs.to_str().unwrap()]).await;
        run(&theirs, &["config", "user.name", "Other"]).await;
        run(&theirs, &["config", "user.email", "other@example.com"]).await;
        std::fs::write(theirs.join("other.md"), "theirs\n").unwrap();
        run(&theirs, &["add", "-A"]).await;
        run(&theirs, &["commit", "-m", "remote change"]).await;
        run(&theirs, &["push"]).await;

        // Local commit diverges; safe_push reconciles via rebase.
        std::fs::write(ours.join("local.md"), "ours\n").unwrap();
        let git = engine(&ours);
        git.commit_if_dirty("Local change", None).await.unwrap();
        let strategy = git.safe_push("main").await.unwrap();
        assert_eq!(strategy, PushStrategy::Rebased);
    }

    #[tokio::test]
    async fn test_safe_push_merges_ours_on_conflict() {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        std::fs::create_dir(&remote).unwrap();
        run(&remote, &["init", "--bare", "--initial-branch=main"]).await;
        let remote_url = remote.to_str().unwrap().to_string();

        let ours = tmp.path().join("ours");
        std::fs::create_dir(&ours).unwrap();
        init_repo(&ours).await;
        run(&ours, &["remote", "add", "origin", &remote_url]).await;
        run(&ours, &["push", "-u", "origin", "main"]).await;

        // Remote edits the same file.
        let theirs = tmp.path().join("theirs");
        run(tmp.path(), &["clone", &remote_url, theirs.to_str().unwrap()]).await;
        run(&theirs, &["config", "user.name", "Other"]).await;
        run(&theirs, &["config", "user.email", "other@example.com"]).await;
        std::fs::write(theirs.join("index.md"), "remote version\n").unwrap();
        run(&theirs, &["add", "-A"]).await;
        run(&theirs, &["commit", "-m", "remote edit"]).await;
        run(&theirs, &["push"]).await;

        // Local edits the same file differently.
        std::fs::write(ours.join("index.md"), "local version\n").unwrap();
        let git = engine(&ours);
        git.commit_if_dirty("Local edit", None).await.unwrap();
        let strategy = git.safe_push("main").await.unwrap();
        assert_eq!(strategy, PushStrategy::MergedOurs);

        // Ours won.
        let content = std::fs::read_to_string(ours.join("index.md")).unwrap();
        assert_eq!(content, "local version\n");
        assert!(!git.is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_cleans_conflicted_merge() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let git = engine(tmp.path());

        // Conflicting branches.
        run(tmp.path(), &["checkout", "-b", "other"]).await;
        std::fs::write(tmp.path().join("index.md"), "other\n").unwrap();
        run(tmp.path(), &["add", "-A"]).await;
        run(tmp.path(), &["commit", "-m", "other"]).await;
        run(tmp.path(), &["checkout", "main"]).await;
        std::fs::write(tmp.path().join("index.md"), "main\n").unwrap();
        run(tmp.path(), &["add", "-A"]).await;
        run(tmp.path(), &["commit", "-m", "main"]).await;

        // Start a merge that conflicts, then recover.
        let merge = Command::new("git")
            .args(["merge", "other"])
            .current_dir(tmp.path())
            .output()
            .await
            .unwrap();
        assert!(!merge.status.success());

        git.recover().await.unwrap();
        assert!(!git.is_dirty().await.unwrap());
        assert_eq!(git.current_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn test_resolve_conflicts_ours_noop_on_clean_tree() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path()).await;
        let git = engine(tmp.path());
        assert_eq!(
            git.resolve_conflicts_ours().await.unwrap(),
            ResolveOutcome::NothingToDo
        );
    }
}
