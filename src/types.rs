// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for the edit worker.
//!
//! This module defines the fundamental data structures shared across the
//! claim manager, work pump, preemption listener, and workflow runner:
//! the owner key, the wire messages, the active-job record, and the
//! structured workflow result.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Owner Key
// ============================================================================

/// The `(project, user)` pair a worker claims exclusive responsibility for.
///
/// Serves as the partition key for the ownership and active-job tables and
/// as the message group of the owned FIFO queue (`{project}#{user}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey {
    /// Project identifier.
    pub project: String,
    /// User identifier within the project.
    pub user: String,
}

impl OwnerKey {
    /// Create a new owner key.
    pub fn new(project: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            user: user.into(),
        }
    }

    /// The table partition key / FIFO message group id.
    pub fn partition_key(&self) -> String {
        format!("{}#{}", self.project, self.user)
    }

    /// Workspace directory for this owner under the given root:
    /// `{root}/{project}/{user}/{repo_name}`.
    pub fn workspace_dir(&self, root: &Path, repo_name: &str) -> PathBuf {
        root.join(&self.project).join(&self.user).join(repo_name)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.user)
    }
}

/// Derive the repository directory name from its clone URL.
///
/// `https://host/org/site.git` and `https://host/org/site` both map to
/// `site`.
pub fn repo_name_from_url(repo_url: &str) -> String {
    let trimmed = repo_url.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_end_matches(".git").to_string()
}

// ============================================================================
// Worker Identity
// ============================================================================

/// Process-wide immutable identity, assigned once at startup.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    /// Unique id for this worker instance.
    pub worker_id: String,
    /// When this process started.
    pub started_at: DateTime<Utc>,
}

impl WorkerIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            worker_id: format!("editd-{}", Uuid::new_v4()),
            started_at: Utc::now(),
        }
    }
}

// ============================================================================
// Wire Messages
// ============================================================================

/// A claim request from the cluster-wide unclaimed queue.
///
/// Names a `(project, user)` pair available for claiming and the URL of
/// that pair's owned work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    /// Message discriminator; always `claim_request`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Project identifier.
    pub project: String,
    /// User identifier.
    pub user: String,
    /// URL of the owned FIFO work queue for this pair.
    pub queue_url: String,
}

impl ClaimRequest {
    /// The owner key this request offers.
    pub fn owner_key(&self) -> OwnerKey {
        OwnerKey::new(&self.project, &self.user)
    }
}

/// An instruction from the owned work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkMessage {
    /// Orchestrator task token to report against.
    pub task_token: String,
    /// Unique instruction id.
    pub message_id: String,
    /// Conversation thread id; selects the thread branch.
    pub thread_id: String,
    /// Project identifier.
    pub project_id: String,
    /// User identifier.
    pub user_id: String,
    /// Upstream repository clone URL.
    pub repo_url: String,
    /// Human-language edit instruction.
    pub instruction: String,
    /// Optional pre-resolved attachment pointers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
}

impl WorkMessage {
    /// The owner key this message belongs to.
    pub fn owner_key(&self) -> OwnerKey {
        OwnerKey::new(&self.project_id, &self.user_id)
    }

    /// The git branch this instruction runs on.
    pub fn thread_branch(&self) -> String {
        format!("thread-{}", self.thread_id)
    }

    /// Validate required fields beyond what serde enforces.
    ///
    /// Returns the first problem found, or `None` if the message is
    /// well-formed. Malformed messages are terminal: deleted, never
    /// retried.
    pub fn validate(&self) -> Option<String> {
        let required = [
            ("taskToken", &self.task_token),
            ("messageId", &self.message_id),
            ("threadId", &self.thread_id),
            ("projectId", &self.project_id),
            ("userId", &self.user_id),
            ("repoUrl", &self.repo_url),
            ("instruction", &self.instruction),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Some(format!("missing or empty field: {name}"));
            }
        }
        None
    }
}

/// A preemption notice from the owned interrupt queue.
///
/// Matches an in-flight job iff `(project, user, old_message_id)` equals
/// the active job's `(project, user, message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptMessage {
    /// Project identifier.
    pub project_id: String,
    /// User identifier.
    pub user_id: String,
    /// Instruction id being superseded.
    pub old_message_id: String,
    /// Instruction id doing the superseding.
    pub new_message_id: String,
    /// When the interrupt was issued.
    pub timestamp: DateTime<Utc>,
}

impl InterruptMessage {
    /// The owner key this interrupt targets.
    pub fn owner_key(&self) -> OwnerKey {
        OwnerKey::new(&self.project_id, &self.user_id)
    }

    /// Check whether this interrupt supersedes the given active job.
    pub fn matches(&self, job: &ActiveJob) -> bool {
        self.owner_key() == job.key && self.old_message_id == job.message_id
    }
}

// ============================================================================
// Active Job
// ============================================================================

/// The zero-or-one in-flight instruction for an owned `(project, user)`.
///
/// Held in memory by the work pump and mirrored to the active-job table
/// (with a TTL as a safety net). The receipt handle is what the pump
/// deletes to unblock the FIFO queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    /// Owner key.
    pub key: OwnerKey,
    /// Instruction id.
    pub message_id: String,
    /// Orchestrator task token.
    pub task_token: String,
    /// Queue receipt handle of the original work message.
    pub receipt_handle: String,
    /// Conversation thread id.
    pub thread_id: String,
    /// When the job was picked up.
    pub started_at: DateTime<Utc>,
}

impl ActiveJob {
    /// Build an active-job record from a freshly received message.
    pub fn from_message(message: &WorkMessage, receipt_handle: impl Into<String>) -> Self {
        Self {
            key: message.owner_key(),
            message_id: message.message_id.clone(),
            task_token: message.task_token.clone(),
            receipt_handle: receipt_handle.into(),
            thread_id: message.thread_id.clone(),
            started_at: Utc::now(),
        }
    }
}

// ============================================================================
// Workflow Result
// ============================================================================

/// Terminal outcome of one instruction pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The pipeline ran to the end. Individual steps may still have
    /// degraded (build failed, push failed); see the report flags.
    Completed,
    /// A newer instruction aborted this one mid-flight.
    Preempted,
    /// The pipeline could not produce a usable result.
    Failed {
        /// Failure classification reported to the orchestrator.
        reason: FailureReason,
    },
}

/// Failure classifications reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Superseded by a newer instruction; not an error.
    Preempted,
    /// The edit subprocess exited non-zero.
    ClaudeFailed,
    /// The build subprocess exited non-zero.
    BuildFailed,
    /// The object-store mirror failed.
    PublishFailed,
    /// Every push strategy was exhausted.
    PushFailed,
    /// Heartbeats to the orchestrator stopped landing.
    HeartbeatLost,
    /// The message could not be deserialized or validated.
    MalformedMessage,
    /// Anything unexpected.
    Internal,
}

impl FailureReason {
    /// Wire string for the callback contract.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preempted => "PREEMPTED",
            Self::ClaudeFailed => "CLAUDE_FAILED",
            Self::BuildFailed => "BUILD_FAILED",
            Self::PublishFailed => "PUBLISH_FAILED",
            Self::PushFailed => "PUSH_FAILED",
            Self::HeartbeatLost => "HEARTBEAT_LOST",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one instruction pipeline, emitted regardless of
/// whether the pipeline completed, failed, or was aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowReport {
    /// Terminal outcome.
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Paths changed by the edit subprocess.
    pub changed_paths: Vec<String>,
    /// Commit created for the edit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Whether the build output reached the object store.
    pub published: bool,
    /// Whether the thread branch reached the upstream remote.
    pub pushed: bool,
    /// Per-step diagnostics for operators and failure callbacks.
    #[serde(default)]
    pub diagnostics: Vec<String>,
    /// The remote rejected our credentials; the claim must be
    /// surrendered. Process-internal, never serialized.
    #[serde(skip)]
    pub auth_failure: bool,
}

impl WorkflowReport {
    /// A report with nothing done yet.
    pub fn empty(outcome: Outcome) -> Self {
        Self {
            outcome,
            changed_paths: Vec::new(),
            commit_sha: None,
            published: false,
            pushed: false,
            diagnostics: Vec::new(),
            auth_failure: false,
        }
    }

    /// Success payload for the callback gateway.
    pub fn success_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "changedPaths": self.changed_paths,
            "commitSha": self.commit_sha,
            "published": self.published,
            "pushed": self.pushed,
        })
    }

    /// Detail string for failure callbacks.
    pub fn failure_detail(&self) -> String {
        if self.diagnostics.is_empty() {
            "no diagnostics".to_string()
        } else {
            self.diagnostics.join("; ")
        }
    }
}
