// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQS-backed queue consumer.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::queue::{MessageQueue, ReceivedMessage};

/// Queue consumer over one shared SQS client; the queue URL is passed
/// per call, so a single instance serves the unclaimed, work, and
/// interrupt queues alike.
#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
}

impl SqsQueue {
    /// Wrap an SQS client.
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(
        &self,
        queue_url: &str,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .send()
            .await
            .map_err(|err| QueueError::Receive(err.to_string()))?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let body = message
            .body()
            .ok_or_else(|| QueueError::Malformed("message without body".to_string()))?
            .to_string();
        let receipt_handle = message
            .receipt_handle()
            .ok_or_else(|| QueueError::Malformed("message without receipt handle".to_string()))?
            .to_string();

        Ok(Some(ReceivedMessage {
            body,
            receipt_handle,
        }))
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|err| QueueError::Delete(err.to_string()))?;
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout.as_secs() as i32)
            .send()
            .await
            .map_err(|err| QueueError::Visibility(err.to_string()))?;
        Ok(())
    }
}
