// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Step Functions task-token callback gateway.

use async_trait::async_trait;
use tracing::debug;

use crate::callback::CallbackGateway;
use crate::error::CallbackError;
use crate::types::FailureReason;

/// Cap on the failure cause field accepted by the service.
const MAX_CAUSE_LEN: usize = 32_000;

/// Callback gateway over Step Functions `SendTask*` calls.
#[derive(Clone)]
pub struct SfnCallbackGateway {
    client: aws_sdk_sfn::Client,
}

impl SfnCallbackGateway {
    /// Wrap a Step Functions client.
    pub fn new(client: aws_sdk_sfn::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackGateway for SfnCallbackGateway {
    async fn heartbeat(&self, task_token: &str) -> Result<(), CallbackError> {
        self.client
            .send_task_heartbeat()
            .task_token(task_token)
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_task_timed_out() || service.is_task_does_not_exist() {
                    CallbackError::TokenGone
                } else {
                    CallbackError::Transport(service.to_string())
                }
            })?;
        debug!("Heartbeat delivered");
        Ok(())
    }

    async fn report_success(
        &self,
        task_token: &str,
        result: &serde_json::Value,
    ) -> Result<(), CallbackError> {
        let output = serde_json::to_string(result)
            .map_err(|err| CallbackError::Rejected(err.to_string()))?;
        self.client
            .send_task_success()
            .task_token(task_token)
            .output(output)
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_task_timed_out() || service.is_task_does_not_exist() {
                    CallbackError::TokenGone
                } else if service.is_invalid_output() || service.is_invalid_token() {
                    CallbackError::Rejected(service.to_string())
                } else {
                    CallbackError::Transport(service.to_string())
                }
            })?;
        Ok(())
    }

    async fn report_failure(
        &self,
        task_token: &str,
        reason: FailureReason,
        detail: &str,
    ) -> Result<(), CallbackError> {
        let cause: String = detail.chars().take(MAX_CAUSE_LEN).collect();
        self.client
            .send_task_failure()
            .task_token(task_token)
            .error(reason.as_str())
            .cause(cause)
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_task_timed_out() || service.is_task_does_not_exist() {
                    CallbackError::TokenGone
                } else if service.is_invalid_token() {
                    CallbackError::Rejected(service.to_string())
                } else {
                    CallbackError::Transport(service.to_string())
                }
            })?;
        Ok(())
    }
}
