// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Preemption listener: cancels in-flight work when a newer instruction
//! arrives for the owned `(project, user)`.
//!
//! Runs concurrently with the work pump on a separate interrupt queue.
//! The separation matters: the work queue is FIFO and head-of-line
//! blocked by the in-flight message, so an interrupt sent through it
//! could never overtake the work it needs to cancel.
//!
//! The listener never mutates the workspace and performs no terminal
//! queue or callback actions for the work message itself; it aborts the
//! pipeline, waits for it to settle, and deletes the interrupt. The pump,
//! as the single outcome handler, then reports PREEMPTED and deletes the
//! work message, which is what unblocks the FIFO for the superseding one.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::MessageQueue;
use crate::store::ActiveJobStore;
use crate::types::{ActiveJob, InterruptMessage, OwnerKey};
use crate::workflow::Pipeline;

/// Long-poll wait per receive call.
const RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// Polling step while waiting for an aborted pipeline to settle.
const SETTLE_POLL: Duration = Duration::from_millis(100);

/// The preemption listener for one claimed owner.
pub struct PreemptListener {
    queue: Arc<dyn MessageQueue>,
    jobs: Arc<dyn ActiveJobStore>,
    pipeline: Arc<dyn Pipeline>,
    /// In-flight job slot shared with the work pump.
    active: Arc<StdMutex<Option<ActiveJob>>>,
    key: OwnerKey,
    queue_url: String,
    /// Upper bound on the settle wait after an abort.
    settle_timeout: Duration,
}

impl PreemptListener {
    /// Create a listener.
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        jobs: Arc<dyn ActiveJobStore>,
        pipeline: Arc<dyn Pipeline>,
        active: Arc<StdMutex<Option<ActiveJob>>>,
        key: OwnerKey,
        queue_url: String,
        settle_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            jobs,
            pipeline,
            active,
            key,
            queue_url,
            settle_timeout,
        }
    }

    /// Run the listener until shutdown or ownership loss.
    pub async fn run(
        &self,
        mut owned: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() || !*owned.borrow() {
                return;
            }

            let received = tokio::select! {
                result = self.queue.receive(&self.queue_url, RECEIVE_WAIT) => {
                    match result {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(error = %err, "Interrupt queue receive failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                _ = shutdown.changed() => continue,
                _ = owned.changed() => continue,
            };

            let Some(received) = received else { continue };

            let interrupt: InterruptMessage = match serde_json::from_str(&received.body) {
                Ok(interrupt) => interrupt,
                Err(err) => {
                    warn!(error = %err, "Dropping malformed interrupt message");
                    self.delete_interrupt(&received.receipt_handle).await;
                    continue;
                }
            };

            self.handle_interrupt(&interrupt).await;
            self.delete_interrupt(&received.receipt_handle).await;
        }
    }

    /// Abort the in-flight pipeline iff the interrupt matches it.
    async fn handle_interrupt(&self, interrupt: &InterruptMessage) {
        if interrupt.owner_key() != self.key {
            warn!(
                interrupt_owner = %interrupt.owner_key(),
                owner = %self.key,
                "Interrupt for a different owner on our queue; dropping"
            );
            return;
        }

        // Check the in-memory job first; fall back to the table for the
        // window between pickup and the in-memory write of a future
        // pump generation.
        let in_memory = self
            .active
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        let job = match in_memory {
            Some(job) => Some(job),
            None => match self.jobs.get(&self.key).await {
                Ok(job) => job,
                Err(err) => {
                    warn!(error = %err, "Active-job lookup failed; treating interrupt as stale");
                    None
                }
            },
        };

        let Some(job) = job else {
            debug!(
                old_message_id = %interrupt.old_message_id,
                "Interrupt matches no active job; stale"
            );
            return;
        };

        if !interrupt.matches(&job) {
            debug!(
                old_message_id = %interrupt.old_message_id,
                active_message_id = %job.message_id,
                "Interrupt does not supersede the active job; stale"
            );
            return;
        }

        info!(
            old_message_id = %interrupt.old_message_id,
            new_message_id = %interrupt.new_message_id,
            "Preempting in-flight instruction"
        );
        self.pipeline.abort();
        self.wait_for_settle(&job.message_id).await;
    }

    /// Wait, bounded, for the pump to clear the aborted job.
    async fn wait_for_settle(&self, message_id: &str) {
        let deadline = tokio::time::Instant::now() + self.settle_timeout;
        loop {
            let still_active = self
                .active
                .lock()
                .ok()
                .and_then(|slot| slot.as_ref().map(|job| job.message_id.clone()))
                .is_some_and(|active_id| active_id == message_id);
            if !still_active {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(message_id, "Aborted pipeline did not settle within the bound");
                return;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    async fn delete_interrupt(&self, receipt_handle: &str) {
        if let Err(err) = self.queue.delete(&self.queue_url, receipt_handle).await {
            warn!(error = %err, "Interrupt delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MockMessageQueue;
    use crate::store::MockActiveJobStore;
    use crate::types::WorkMessage;
    use crate::workflow::MockPipeline;
    use chrono::Utc;

    fn key() -> OwnerKey {
        OwnerKey::new("amelia", "scott")
    }

    fn active_job() -> ActiveJob {
        let msg: WorkMessage = serde_json::from_value(serde_json::json!({
            "taskToken": "T1",
            "messageId": "M1",
            "threadId": "abc",
            "projectId": "amelia",
            "userId": "scott",
            "repoUrl": "https://example.com/site.git",
            "instruction": "add a hero section",
        }))
        .unwrap();
        ActiveJob::from_message(&msg, "R1")
    }

    fn interrupt(old: &str) -> InterruptMessage {
        InterruptMessage {
            project_id: "amelia".to_string(),
            user_id: "scott".to_string(),
            old_message_id: old.to_string(),
            new_message_id: "M2".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn listener(
        jobs: MockActiveJobStore,
        pipeline: MockPipeline,
        active: Arc<StdMutex<Option<ActiveJob>>>,
    ) -> PreemptListener {
        PreemptListener::new(
            Arc::new(MockMessageQueue::new()),
            Arc::new(jobs),
            Arc::new(pipeline),
            active,
            key(),
            "https://sqs.test/interrupts".to_string(),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_matching_interrupt_aborts_pipeline() {
        let active = Arc::new(StdMutex::new(Some(active_job())));
        let mut pipeline = MockPipeline::new();

        // The abort is what eventually clears the slot; emulate the pump.
        let slot = Arc::clone(&active);
        pipeline.expect_abort().times(1).returning(move || {
            *slot.lock().unwrap() = None;
        });

        let listener = listener(MockActiveJobStore::new(), pipeline, active);
        listener.handle_interrupt(&interrupt("M1")).await;
    }

    #[tokio::test]
    async fn test_stale_interrupt_is_noop() {
        let active = Arc::new(StdMutex::new(Some(active_job())));
        let mut pipeline = MockPipeline::new();
        pipeline.expect_abort().never();

        let listener = listener(MockActiveJobStore::new(), pipeline, active);
        listener.handle_interrupt(&interrupt("M0")).await;
    }

    #[tokio::test]
    async fn test_interrupt_with_no_active_job_checks_table() {
        let active = Arc::new(StdMutex::new(None));
        let mut jobs = MockActiveJobStore::new();
        jobs.expect_get().times(1).returning(|_| Ok(None));
        let mut pipeline = MockPipeline::new();
        pipeline.expect_abort().never();

        let listener = listener(jobs, pipeline, active);
        listener.handle_interrupt(&interrupt("M1")).await;
    }

    #[tokio::test]
    async fn test_interrupt_matching_table_record_aborts() {
        // Pickup window: the pump stored the receipt but this listener
        // instance has no in-memory view; the table record decides.
        let active = Arc::new(StdMutex::new(None));
        let mut jobs = MockActiveJobStore::new();
        jobs.expect_get().returning(|_| Ok(Some(active_job())));
        let mut pipeline = MockPipeline::new();
        pipeline.expect_abort().times(1).returning(|| ());

        let listener = listener(jobs, pipeline, active);
        listener.handle_interrupt(&interrupt("M1")).await;
    }

    #[tokio::test]
    async fn test_wrong_owner_interrupt_dropped() {
        let active = Arc::new(StdMutex::new(Some(active_job())));
        let mut pipeline = MockPipeline::new();
        pipeline.expect_abort().never();

        let listener = listener(MockActiveJobStore::new(), pipeline, active);
        let mut wrong = interrupt("M1");
        wrong.user_id = "other".to_string();
        listener.handle_interrupt(&wrong).await;
    }

    #[tokio::test]
    async fn test_settle_wait_times_out() {
        // The pump never clears the slot; the bounded wait must return.
        let active = Arc::new(StdMutex::new(Some(active_job())));
        let mut pipeline = MockPipeline::new();
        pipeline.expect_abort().times(1).returning(|| ());

        let listener = listener(MockActiveJobStore::new(), pipeline, Arc::clone(&active));
        let start = std::time::Instant::now();
        listener.handle_interrupt(&interrupt("M1")).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert!(active.lock().unwrap().is_some());
    }
}
