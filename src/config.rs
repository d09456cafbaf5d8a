// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker configuration.
//!
//! Every knob is a CLI flag with an `EDITD_*` environment fallback, so the
//! container image can be configured entirely through its environment.
//! Durations are accepted as whole seconds and converted once here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::types::OwnerKey;

/// Queue-driven site-editing worker.
#[derive(Debug, Clone, Parser)]
#[command(name = "editd")]
#[command(author, version, about = "Claims a (project, user) pair and executes its edit queue", long_about = None)]
pub struct WorkerOptions {
    /// Root of the persistent workspace mount.
    #[arg(long, env = "EDITD_WORKSPACE_ROOT", default_value = "/workspaces")]
    pub workspace_root: PathBuf,

    /// URL of the cluster-wide unclaimed queue.
    #[arg(long, env = "EDITD_UNCLAIMED_QUEUE_URL")]
    pub unclaimed_queue_url: String,

    /// URL pattern of the per-owner interrupt queue; `{project}` and
    /// `{user}` are substituted.
    #[arg(long, env = "EDITD_INTERRUPT_QUEUE_URL_PATTERN")]
    pub interrupt_queue_url_pattern: String,

    /// Name of the ownership table.
    #[arg(long, env = "EDITD_OWNERSHIP_TABLE", default_value = "edit-ownership")]
    pub ownership_table: String,

    /// Name of the active-job table.
    #[arg(long, env = "EDITD_ACTIVE_JOB_TABLE", default_value = "edit-active-job")]
    pub active_job_table: String,

    /// Token for the upstream git remote (HTTPS).
    #[arg(long, env = "EDITD_GIT_TOKEN", hide_env_values = true)]
    pub git_token: String,

    /// Committer name for commits created by the worker.
    #[arg(long, env = "EDITD_GIT_COMMITTER_NAME", default_value = "Edit Worker")]
    pub git_committer_name: String,

    /// Committer email for commits created by the worker.
    #[arg(long, env = "EDITD_GIT_COMMITTER_EMAIL", default_value = "editd@localhost")]
    pub git_committer_email: String,

    /// Code-editing subprocess; receives the instruction as its final
    /// argument, runs with the workspace as its working directory.
    #[arg(long, env = "EDITD_EDIT_COMMAND", default_value = "claude")]
    pub edit_command: String,

    /// Shell command that builds the site inside the workspace.
    #[arg(long, env = "EDITD_BUILD_COMMAND", default_value = "npm run build")]
    pub build_command: String,

    /// Build output directory, relative to the workspace.
    #[arg(long, env = "EDITD_BUILD_OUTPUT_DIR", default_value = "dist")]
    pub build_output_dir: PathBuf,

    /// Bucket name pattern for the published site; `{project}` is
    /// substituted.
    #[arg(long, env = "EDITD_SITE_BUCKET_PATTERN", default_value = "{project}-edit-site")]
    pub site_bucket_pattern: String,

    /// Seconds between orchestrator heartbeats while a job runs.
    #[arg(long, env = "EDITD_HEARTBEAT_PERIOD_SECS", default_value_t = 30)]
    pub heartbeat_period_secs: u64,

    /// Consecutive heartbeat failures before the job counts as lost.
    #[arg(long, env = "EDITD_HEARTBEAT_FAILURE_THRESHOLD", default_value_t = 3)]
    pub heartbeat_failure_threshold: u32,

    /// Seconds between visibility extensions of the in-flight message.
    #[arg(long, env = "EDITD_VISIBILITY_EXTEND_PERIOD_SECS", default_value_t = 60)]
    pub visibility_extend_period_secs: u64,

    /// Visibility timeout (seconds) applied on each extension. Must exceed
    /// the extension period.
    #[arg(long, env = "EDITD_VISIBILITY_TIMEOUT_SECS", default_value_t = 180)]
    pub visibility_timeout_secs: u64,

    /// Ownership lease duration in seconds.
    #[arg(long, env = "EDITD_LEASE_DURATION_SECS", default_value_t = 90)]
    pub lease_duration_secs: u64,

    /// Lease refresh period in seconds; must be well under the lease
    /// duration (one third is the intended ratio).
    #[arg(long, env = "EDITD_LEASE_REFRESH_PERIOD_SECS", default_value_t = 30)]
    pub lease_refresh_period_secs: u64,

    /// Grace period (seconds) granted to an aborted child before SIGKILL.
    #[arg(long, env = "EDITD_ABORT_GRACE_PERIOD_SECS", default_value_t = 8)]
    pub abort_grace_period_secs: u64,

    /// Whether commits are pushed upstream. Disable for debugging; commits
    /// are still created locally.
    #[arg(
        long,
        env = "EDITD_PUSH_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub push_enabled: bool,

    /// Transient-failure retries inside safe_push.
    #[arg(long, env = "EDITD_PUSH_RETRY_COUNT", default_value_t = 3)]
    pub push_retry_count: u32,
}

impl WorkerOptions {
    /// Heartbeat period as a duration.
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    /// Visibility extension period as a duration.
    pub fn visibility_extend_period(&self) -> Duration {
        Duration::from_secs(self.visibility_extend_period_secs)
    }

    /// Lease duration as a chrono duration (table timestamps are wall
    /// clock).
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_duration_secs as i64)
    }

    /// Lease refresh period as a duration.
    pub fn lease_refresh_period(&self) -> Duration {
        Duration::from_secs(self.lease_refresh_period_secs)
    }

    /// Abort grace period as a duration.
    pub fn abort_grace_period(&self) -> Duration {
        Duration::from_secs(self.abort_grace_period_secs)
    }

    /// Interrupt queue URL for an owner.
    pub fn interrupt_queue_url(&self, key: &OwnerKey) -> String {
        self.interrupt_queue_url_pattern
            .replace("{project}", &key.project)
            .replace("{user}", &key.user)
    }

    /// Site bucket name for a project.
    pub fn site_bucket(&self, project: &str) -> String {
        self.site_bucket_pattern.replace("{project}", project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> WorkerOptions {
        WorkerOptions::parse_from([
            "editd",
            "--unclaimed-queue-url",
            "https://sqs.test/unclaimed",
            "--interrupt-queue-url-pattern",
            "https://sqs.test/{project}-{user}-interrupts",
            "--git-token",
            "secret",
        ])
    }

    #[test]
    fn test_defaults() {
        let opts = options();
        assert_eq!(opts.workspace_root, PathBuf::from("/workspaces"));
        assert_eq!(opts.lease_duration_secs, 90);
        assert_eq!(opts.lease_refresh_period_secs, 30);
        assert!(opts.push_enabled);
        assert_eq!(opts.build_output_dir, PathBuf::from("dist"));
    }

    #[test]
    fn test_interrupt_queue_url_substitution() {
        let opts = options();
        let key = OwnerKey::new("amelia", "scott");
        assert_eq!(
            opts.interrupt_queue_url(&key),
            "https://sqs.test/amelia-scott-interrupts"
        );
    }

    #[test]
    fn test_site_bucket_substitution() {
        let opts = options();
        assert_eq!(opts.site_bucket("amelia"), "amelia-edit-site");
    }

    #[test]
    fn test_refresh_shorter_than_lease() {
        let opts = options();
        assert!(opts.lease_refresh_period_secs * 3 <= opts.lease_duration_secs);
        assert!(opts.lease_refresh_period() < Duration::from_secs(opts.lease_duration_secs));
    }
}
