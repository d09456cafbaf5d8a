// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Queue consumer seam.
//!
//! The worker consumes three queues (unclaimed, owned work, owned
//! interrupt) through one narrow trait: receive a single message with a
//! long-poll wait, delete by receipt handle, and adjust visibility. The
//! production implementation lives in [`crate::aws::SqsQueue`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;

/// A message pulled off a queue, with the handle needed to delete it or
/// change its visibility.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Raw message body.
    pub body: String,
    /// Opaque receipt handle for this delivery.
    pub receipt_handle: String,
}

/// One-at-a-time queue consumer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Long-poll for at most one message.
    async fn receive(
        &self,
        queue_url: &str,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Delete a message by its receipt handle.
    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Change the remaining visibility of an in-flight message. A zero
    /// timeout returns the message to the queue immediately.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError>;
}
