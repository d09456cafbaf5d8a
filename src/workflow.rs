// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow runner: the per-instruction pipeline.
//!
//! For one accepted work message the runner executes, in order: prepare
//! the thread branch, run the edit subprocess, commit, build, publish,
//! push. The runner tracks the currently running child process so the
//! preemption listener can abort the pipeline mid-subprocess, and its
//! post-abort cleanup parks partial work in a WIP commit, publishes any
//! build output that exists, and pushes — a preempted instruction leaves
//! the workspace exactly as recoverable as a completed one.
//!
//! At most one pipeline runs at a time per worker; the work pump enforces
//! that. The runner itself only guards the abort path.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::WorkerOptions;
use crate::error::GitError;
use crate::git::{derive_commit_message, wip_subject, CommitOutcome, GitEngine};
use crate::publish::SitePublisher;
use crate::types::{repo_name_from_url, FailureReason, Outcome, WorkMessage, WorkflowReport};

/// Characters of subprocess output kept in diagnostics.
const DIAGNOSTIC_TAIL: usize = 500;

/// Bound on draining a dead child's output pipes. Grandchildren that
/// survive the child can hold the pipe open; they lose their output.
const STREAM_DRAIN: Duration = Duration::from_secs(2);

/// An abortable instruction pipeline.
///
/// The work pump drives `run`; the preemption listener, the heartbeat
/// watchdog, and the claim manager only ever call `abort`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Execute the pipeline for one message and return its report.
    async fn run(&self, message: &WorkMessage) -> WorkflowReport;

    /// Request a cooperative abort of the in-flight pipeline. Safe to
    /// call any number of times, from any task; a no-op when nothing is
    /// running.
    fn abort(&self);
}

/// Static configuration for the runner, extracted from the worker
/// options once at claim time.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root of the persistent workspace mount.
    pub workspace_root: PathBuf,
    /// Git remote token.
    pub git_token: String,
    /// Committer name.
    pub committer_name: String,
    /// Committer email.
    pub committer_email: String,
    /// Edit subprocess; instruction text is appended as the final
    /// argument.
    pub edit_command: String,
    /// Build command, run through `sh -c`.
    pub build_command: String,
    /// Build output directory, relative to the workspace.
    pub build_output_dir: PathBuf,
    /// Grace period between SIGINT and SIGKILL on abort.
    pub abort_grace: Duration,
    /// Whether commits are pushed upstream.
    pub push_enabled: bool,
    /// Transient-failure retries inside safe_push.
    pub push_retry_count: u32,
}

impl From<&WorkerOptions> for RunnerConfig {
    fn from(options: &WorkerOptions) -> Self {
        Self {
            workspace_root: options.workspace_root.clone(),
            git_token: options.git_token.clone(),
            committer_name: options.git_committer_name.clone(),
            committer_email: options.git_committer_email.clone(),
            edit_command: options.edit_command.clone(),
            build_command: options.build_command.clone(),
            build_output_dir: options.build_output_dir.clone(),
            abort_grace: options.abort_grace_period(),
            push_enabled: options.push_enabled,
            push_retry_count: options.push_retry_count,
        }
    }
}

/// The workflow runner bound to one claimed owner.
pub struct WorkflowRunner {
    config: RunnerConfig,
    publisher: Arc<dyn SitePublisher>,
    /// Abort latch for the in-flight instruction; reset at the start of
    /// each run.
    abort_tx: watch::Sender<bool>,
    /// Pid of the currently running child subprocess, if any. Non-nil
    /// exactly while an edit or build child is executing.
    child_pid: StdMutex<Option<u32>>,
}

impl WorkflowRunner {
    /// Create a runner.
    pub fn new(config: RunnerConfig, publisher: Arc<dyn SitePublisher>) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            config,
            publisher,
            abort_tx,
            child_pid: StdMutex::new(None),
        }
    }

    fn is_aborting(&self) -> bool {
        *self.abort_tx.borrow()
    }

    fn workdir(&self, message: &WorkMessage) -> PathBuf {
        let repo_name = repo_name_from_url(&message.repo_url);
        message
            .owner_key()
            .workspace_dir(&self.config.workspace_root, &repo_name)
    }

    fn output_dir(&self, message: &WorkMessage) -> PathBuf {
        self.workdir(message).join(&self.config.build_output_dir)
    }

    fn engine_for(&self, message: &WorkMessage) -> GitEngine {
        GitEngine::new(
            self.workdir(message),
            &self.config.git_token,
            &self.config.committer_name,
            &self.config.committer_email,
        )
        .with_push_retries(self.config.push_retry_count)
    }

    async fn run_inner(&self, message: &WorkMessage) -> crate::error::Result<WorkflowReport> {
        let branch = message.thread_branch();
        let git = self.engine_for(message);
        let mut report = WorkflowReport::empty(Outcome::Completed);

        // Step 1: prepare the thread branch from a known-good state.
        git.ensure_repo(&message.repo_url).await?;
        git.recover().await?;
        let switch = git.safe_switch(&branch).await?;
        if switch.stash_kept {
            report
                .diagnostics
                .push("conflicting stash from a previous instruction kept in stash list".into());
        }
        if self.is_aborting() {
            return Ok(self.finalize_preempted(&git, message, report).await);
        }

        // Step 2: edit.
        let edit = self.run_edit(message).await?;
        if edit.aborted {
            return Ok(self.finalize_preempted(&git, message, report).await);
        }
        if !edit.status.success() {
            report.outcome = Outcome::Failed {
                reason: FailureReason::ClaudeFailed,
            };
            report.diagnostics.push(format!(
                "edit: exit {}: {}",
                edit.status.code().unwrap_or(-1),
                tail(&edit.stderr)
            ));
            return Ok(report);
        }
        report.changed_paths = git.changed_paths().await?;

        // Step 3: commit.
        if !report.changed_paths.is_empty() {
            let commit = derive_commit_message(
                &message.instruction,
                &message.message_id,
                &message.user_id,
                &report.changed_paths,
                Utc::now(),
            );
            if let CommitOutcome::Committed { sha } = git
                .commit_if_dirty(&commit.subject, commit.body.as_deref())
                .await?
            {
                report.commit_sha = Some(sha);
            }
        }
        if self.is_aborting() {
            return Ok(self.finalize_preempted(&git, message, report).await);
        }

        // Step 4: build. A failed build does not fail the workflow.
        let build = self.run_build(message).await?;
        if build.aborted {
            return Ok(self.finalize_preempted(&git, message, report).await);
        }
        let build_ok = build.status.success();
        if !build_ok {
            report.diagnostics.push(format!(
                "build: exit {}: {}",
                build.status.code().unwrap_or(-1),
                tail(&build.stderr)
            ));
        }

        // Step 5: publish. A failed build still publishes when a prior
        // run left output behind; no output at all skips straight to
        // the push.
        let output_dir = self.output_dir(message);
        if build_ok || output_dir.is_dir() {
            match self.publisher.mirror(&output_dir, &message.project_id).await {
                Ok(summary) => {
                    report.published = true;
                    debug!(
                        uploaded = summary.uploaded,
                        deleted = summary.deleted,
                        skipped = summary.skipped,
                        "Published build output"
                    );
                }
                Err(err) => {
                    report.diagnostics.push(format!("publish: {err}"));
                }
            }
        }
        if self.is_aborting() {
            return Ok(self.finalize_preempted(&git, message, report).await);
        }

        // Step 6: push.
        if report.commit_sha.is_some() {
            self.push(&git, &branch, &mut report).await;
        }

        Ok(report)
    }

    async fn push(&self, git: &GitEngine, branch: &str, report: &mut WorkflowReport) {
        if !self.config.push_enabled {
            report.diagnostics.push("push disabled by configuration".into());
            return;
        }
        match git.safe_push(branch).await {
            Ok(strategy) => {
                report.pushed = true;
                debug!(branch, ?strategy, "Pushed thread branch");
            }
            Err(err) => {
                if err.is_auth() {
                    report.auth_failure = true;
                }
                report.diagnostics.push(format!("push: {err}"));
            }
        }
    }

    /// Post-abort cleanup: park partial work in a WIP commit, publish any
    /// build output that exists, push.
    async fn finalize_preempted(
        &self,
        git: &GitEngine,
        message: &WorkMessage,
        mut report: WorkflowReport,
    ) -> WorkflowReport {
        report.outcome = Outcome::Preempted;
        info!(message_id = %message.message_id, "Finalizing preempted instruction");

        // The abort may have landed mid-operation; start from a state the
        // commit below can proceed from.
        if let Err(err) = git.recover().await {
            report.diagnostics.push(format!("recover: {err}"));
        }

        match git.changed_paths().await {
            Ok(paths) if !paths.is_empty() => {
                if report.changed_paths.is_empty() {
                    report.changed_paths = paths;
                }
                let subject = wip_subject(&message.instruction);
                match git.commit_if_dirty(&subject, None).await {
                    Ok(CommitOutcome::Committed { sha }) => report.commit_sha = Some(sha),
                    Ok(CommitOutcome::NothingToCommit) => {}
                    Err(err) => report.diagnostics.push(format!("wip commit: {err}")),
                }
            }
            Ok(_) => {}
            Err(err) => report.diagnostics.push(format!("wip status: {err}")),
        }

        // A partial build beats a stale published site.
        let output_dir = self.output_dir(message);
        if output_dir.is_dir() {
            match self.publisher.mirror(&output_dir, &message.project_id).await {
                Ok(_) => report.published = true,
                Err(err) => report.diagnostics.push(format!("publish: {err}")),
            }
        }

        if report.commit_sha.is_some() {
            self.push(git, &message.thread_branch(), &mut report).await;
        }

        report
    }

    async fn run_edit(&self, message: &WorkMessage) -> std::io::Result<ChildResult> {
        let workdir = self.workdir(message);
        let mut parts = self.config.edit_command.split_whitespace();
        let program = parts.next().unwrap_or("claude");
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg(&message.instruction)
            .current_dir(&workdir);
        if let Some(attachments) = &message.attachments {
            if let Ok(json) = serde_json::to_string(attachments) {
                cmd.env("EDITD_ATTACHMENTS", json);
            }
        }
        self.run_child(cmd, "edit").await
    }

    async fn run_build(&self, message: &WorkMessage) -> std::io::Result<ChildResult> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.build_command)
            .current_dir(self.workdir(message));
        self.run_child(cmd, "build").await
    }

    async fn run_child(&self, mut cmd: Command, step: &str) -> std::io::Result<ChildResult> {
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so an abort signal reaches the whole
        // subprocess tree, not just the immediate child.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        if let Ok(mut slot) = self.child_pid.lock() {
            *slot = child.id();
        }
        debug!(step, pid = ?child.id(), "Spawned subprocess");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(read_stream(stdout));
        let err_task = tokio::spawn(read_stream(stderr));

        let status = self.wait_child(&mut child).await;
        if let Ok(mut slot) = self.child_pid.lock() {
            *slot = None;
        }
        let status = status?;

        let stdout = match timeout(STREAM_DRAIN, out_task).await {
            Ok(Ok(output)) => output,
            _ => String::new(),
        };
        let stderr = match timeout(STREAM_DRAIN, err_task).await {
            Ok(Ok(output)) => output,
            _ => String::new(),
        };
        let aborted = self.is_aborting() || terminated_by_signal(&status);
        debug!(step, code = ?status.code(), aborted, "Subprocess exited");

        Ok(ChildResult {
            status,
            stdout,
            stderr,
            aborted,
        })
    }

    /// Wait for the child, delivering SIGINT on abort and escalating to
    /// SIGKILL after the grace period.
    async fn wait_child(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let mut abort_rx = self.abort_tx.subscribe();
        if !*abort_rx.borrow() {
            tokio::select! {
                status = child.wait() => return status,
                _ = abort_rx.wait_for(|aborting| *aborting) => {}
            }
        }

        if let Some(pid) = child.id() {
            signal_group(pid, AbortSignal::Interrupt);
        }
        match timeout(self.config.abort_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Child ignored SIGINT past the grace period; killing");
                if let Some(pid) = child.id() {
                    signal_group(pid, AbortSignal::Kill);
                }
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

#[async_trait]
impl Pipeline for WorkflowRunner {
    async fn run(&self, message: &WorkMessage) -> WorkflowReport {
        // Clear any abort left over from the previous instruction.
        self.abort_tx.send_replace(false);

        match self.run_inner(message).await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Pipeline error; recovering workspace");
                let git = self.engine_for(message);
                let _ = git.recover().await;

                let mut report = WorkflowReport::empty(Outcome::Failed {
                    reason: FailureReason::Internal,
                });
                report.diagnostics.push(format!("internal: {err:#}"));
                if let Some(git_err) = err.downcast_ref::<GitError>() {
                    if git_err.is_auth() {
                        report.auth_failure = true;
                    }
                }
                report
            }
        }
    }

    fn abort(&self) {
        let was_aborting = self.abort_tx.send_replace(true);
        if !was_aborting {
            info!("Pipeline abort requested");
        }
    }
}

/// Output of one supervised subprocess.
struct ChildResult {
    status: ExitStatus,
    #[allow(dead_code)]
    stdout: String,
    stderr: String,
    aborted: bool,
}

async fn read_stream<R>(stream: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    match stream {
        Some(mut s) => {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        }
        None => String::new(),
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= DIAGNOSTIC_TAIL {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - DIAGNOSTIC_TAIL).collect()
    }
}

/// Signals deliverable to an aborted child's process group.
#[derive(Debug, Clone, Copy)]
enum AbortSignal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: AbortSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let signal = match signal {
        AbortSignal::Interrupt => Signal::SIGINT,
        AbortSignal::Kill => Signal::SIGKILL,
    };
    if let Err(err) = killpg(Pid::from_raw(pid as i32), signal) {
        warn!(pid, %signal, error = %err, "Failed to signal child process group");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: AbortSignal) {}

#[cfg(unix)]
fn terminated_by_signal(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn terminated_by_signal(_status: &ExitStatus) -> bool {
    false
}
