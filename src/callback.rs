// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Callback gateway to the orchestrator.
//!
//! Every task token the worker picks up is eventually released with
//! exactly one terminal call (success or failure), kept alive in the
//! meantime with heartbeats. Terminal sends are retried on transport
//! errors; a callback that still cannot be delivered is logged and left
//! to the orchestrator's own token timeout. A gateway failure never turns
//! a successful pipeline into a failed one.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::CallbackError;
use crate::types::FailureReason;

/// Attempts for a terminal callback before giving up.
const TERMINAL_SEND_ATTEMPTS: u32 = 3;

/// Backoff base between terminal-send attempts.
const TERMINAL_SEND_BACKOFF: Duration = Duration::from_millis(500);

/// Outbound contract with the orchestrator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallbackGateway: Send + Sync {
    /// Liveness signal for an in-flight task token.
    async fn heartbeat(&self, task_token: &str) -> Result<(), CallbackError>;

    /// Terminal success with a structured result payload.
    async fn report_success(
        &self,
        task_token: &str,
        result: &serde_json::Value,
    ) -> Result<(), CallbackError>;

    /// Terminal failure. `PREEMPTED` is a first-class reason here, not an
    /// error condition.
    async fn report_failure(
        &self,
        task_token: &str,
        reason: FailureReason,
        detail: &str,
    ) -> Result<(), CallbackError>;
}

/// Deliver a terminal success, retrying transport errors with backoff.
///
/// Returns whether the callback landed. The caller proceeds with message
/// and record cleanup either way.
pub async fn send_success(
    gateway: &dyn CallbackGateway,
    task_token: &str,
    result: &serde_json::Value,
) -> bool {
    let mut attempt = 0u32;
    loop {
        match gateway.report_success(task_token, result).await {
            Ok(()) => return true,
            Err(err) if err.is_retryable() && attempt + 1 < TERMINAL_SEND_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, error = %err, "Success callback failed; retrying");
                tokio::time::sleep(TERMINAL_SEND_BACKOFF * 2u32.pow(attempt)).await;
            }
            Err(err) => {
                error!(error = %err, "Success callback could not be delivered");
                return false;
            }
        }
    }
}

/// Deliver a terminal failure, retrying transport errors with backoff.
pub async fn send_failure(
    gateway: &dyn CallbackGateway,
    task_token: &str,
    reason: FailureReason,
    detail: &str,
) -> bool {
    let mut attempt = 0u32;
    loop {
        match gateway.report_failure(task_token, reason, detail).await {
            Ok(()) => return true,
            Err(err) if err.is_retryable() && attempt + 1 < TERMINAL_SEND_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, %reason, error = %err, "Failure callback failed; retrying");
                tokio::time::sleep(TERMINAL_SEND_BACKOFF * 2u32.pow(attempt)).await;
            }
            Err(err) => {
                error!(%reason, error = %err, "Failure callback could not be delivered");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyGateway {
        failures_before_success: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CallbackGateway for FlakyGateway {
        async fn heartbeat(&self, _task_token: &str) -> Result<(), CallbackError> {
            Ok(())
        }

        async fn report_success(
            &self,
            _task_token: &str,
            _result: &serde_json::Value,
        ) -> Result<(), CallbackError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(CallbackError::Transport("503".to_string()))
            } else {
                Ok(())
            }
        }

        async fn report_failure(
            &self,
            _task_token: &str,
            _reason: FailureReason,
            _detail: &str,
        ) -> Result<(), CallbackError> {
            Err(CallbackError::Rejected("bad token".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_retries_transport_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let gateway = FlakyGateway {
            failures_before_success: 2,
            calls: Arc::clone(&calls),
        };
        let delivered = send_success(&gateway, "T1", &serde_json::json!({})).await;
        assert!(delivered);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_retry_rejections() {
        let gateway = FlakyGateway {
            failures_before_success: 0,
            calls: Arc::new(AtomicU32::new(0)),
        };
        let delivered = send_failure(&gateway, "T1", FailureReason::Preempted, "detail").await;
        assert!(!delivered);
    }
}
