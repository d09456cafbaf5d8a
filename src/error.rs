// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the edit worker.
//!
//! This module provides strongly-typed errors for the worker's subsystems,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error
//! propagation in the binary.

use thiserror::Error;

/// Errors from the git engine.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    Command {
        command: String,
        stderr: String,
    },

    #[error("authentication rejected by remote: {0}")]
    Auth(String),

    #[error("remote unreachable: {0}")]
    Network(String),

    #[error("merge conflicts could not be auto-resolved: {0}")]
    UnresolvedConflict(String),

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Classify a failed git invocation by its stderr.
    pub fn from_command(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        let command = command.into();
        let stderr = stderr.into();
        let lower = stderr.to_lowercase();
        if lower.contains("authentication failed")
            || lower.contains("could not read username")
            || lower.contains("permission denied")
            || lower.contains("403")
            || lower.contains("401")
        {
            Self::Auth(stderr)
        } else if lower.contains("could not resolve host")
            || lower.contains("unable to access")
            || lower.contains("timed out")
            || lower.contains("connection refused")
        {
            Self::Network(stderr)
        } else {
            Self::Command { command, stderr }
        }
    }

    /// Fatal for the current claim: the remote rejected our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Errors from queue consumers.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("receive failed: {0}")]
    Receive(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("visibility change failed: {0}")]
    Visibility(String),

    #[error("malformed message body: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Errors from the ownership / active-job tables.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("conditional check failed")]
    ConditionFailed,

    #[error("table operation failed: {0}")]
    Backend(String),
}

impl StateError {
    /// True when a conditional write lost the race (claim taken, lease
    /// stolen). Not a backend fault.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed)
    }
}

/// Errors from the callback gateway.
#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("callback rejected: {0}")]
    Rejected(String),

    #[error("callback transport error: {0}")]
    Transport(String),

    #[error("task token expired or timed out")]
    TokenGone,
}

impl CallbackError {
    /// Worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors from the site publisher.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("build output directory missing: {0}")]
    MissingOutput(String),

    #[error("upload failed for {key}: {message}")]
    Upload { key: String, message: String },

    #[error("delete failed for {key}: {message}")]
    Delete { key: String, message: String },

    #[error("listing remote objects failed: {0}")]
    List(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
