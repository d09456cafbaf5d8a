// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Work pump: drives the workflow runner from the owned work queue.
//!
//! Single-threaded per owner: one message at a time, pipeline run
//! synchronously within the loop. The FIFO queue's one-in-flight-per-group
//! invariant plus this serial loop give the single-writer guarantee for
//! the workspace. While a pipeline runs, two background timers keep the
//! outside world honest: a visibility extender so the in-flight message is
//! not redelivered, and a heartbeat so the orchestrator knows the token is
//! alive.
//!
//! The pump is the single translator of pipeline outcomes into callback
//! calls and queue deletions, and it performs no terminal action unless
//! the worker still holds ownership of the key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::callback::{send_failure, send_success, CallbackGateway};
use crate::queue::{MessageQueue, ReceivedMessage};
use crate::store::ActiveJobStore;
use crate::types::{ActiveJob, FailureReason, Outcome, WorkMessage};
use crate::workflow::Pipeline;

/// Long-poll wait per receive call.
const RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Graceful shutdown was requested.
    Shutdown,
    /// Ownership of the key was lost.
    LeaseLost,
    /// The git remote rejected our credentials; the claim must be
    /// surrendered.
    AuthFailure,
}

/// Timer and lifetime configuration for the pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Owned work queue URL.
    pub queue_url: String,
    /// Period between visibility extensions.
    pub visibility_extend_period: Duration,
    /// Visibility timeout applied on each extension.
    pub visibility_timeout: Duration,
    /// Period between heartbeats.
    pub heartbeat_period: Duration,
    /// Consecutive heartbeat failures before the job counts as lost.
    pub heartbeat_failure_threshold: u32,
    /// TTL for active-job records.
    pub job_ttl: Duration,
}

/// The work pump for one claimed owner.
pub struct WorkPump {
    queue: Arc<dyn MessageQueue>,
    jobs: Arc<dyn ActiveJobStore>,
    gateway: Arc<dyn CallbackGateway>,
    pipeline: Arc<dyn Pipeline>,
    /// In-flight job, shared with the preemption listener. Written
    /// before the table record so an interrupt racing the pickup always
    /// sees either nothing or the fresh job.
    active: Arc<StdMutex<Option<ActiveJob>>>,
    config: PumpConfig,
}

impl WorkPump {
    /// Create a pump.
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        jobs: Arc<dyn ActiveJobStore>,
        gateway: Arc<dyn CallbackGateway>,
        pipeline: Arc<dyn Pipeline>,
        active: Arc<StdMutex<Option<ActiveJob>>>,
        config: PumpConfig,
    ) -> Self {
        Self {
            queue,
            jobs,
            gateway,
            pipeline,
            active,
            config,
        }
    }

    /// Run the pump until shutdown or ownership loss.
    pub async fn run(
        &self,
        mut owned: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> PumpEnd {
        loop {
            if *shutdown.borrow() {
                return PumpEnd::Shutdown;
            }
            if !*owned.borrow() {
                return PumpEnd::LeaseLost;
            }

            let received = tokio::select! {
                result = self.queue.receive(&self.config.queue_url, RECEIVE_WAIT) => {
                    match result {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(error = %err, "Work queue receive failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                _ = shutdown.changed() => continue,
                _ = owned.changed() => continue,
            };

            let Some(received) = received else { continue };

            match self.handle_message(received, &owned).await {
                MessageEnd::Continue => {}
                MessageEnd::AuthFailure => return PumpEnd::AuthFailure,
            }
        }
    }

    async fn handle_message(
        &self,
        received: ReceivedMessage,
        owned: &watch::Receiver<bool>,
    ) -> MessageEnd {
        // Parse in two steps so a malformed body can still release its
        // task token: pull the token out of the raw JSON, then insist on
        // the full shape.
        let value: Result<serde_json::Value, _> = serde_json::from_str(&received.body);
        let task_token = value
            .as_ref()
            .ok()
            .and_then(|v| v.get("taskToken"))
            .and_then(|t| t.as_str())
            .map(str::to_string);

        let message: Option<WorkMessage> = value
            .ok()
            .and_then(|v| serde_json::from_value(v).ok())
            .filter(|m: &WorkMessage| m.validate().is_none());

        let Some(message) = message else {
            return self
                .reject_malformed(&received, task_token.as_deref(), owned)
                .await;
        };

        info!(
            message_id = %message.message_id,
            thread_id = %message.thread_id,
            "Picked up instruction"
        );

        // The receipt handle is visible to the preemption listener
        // before the table record exists.
        let job = ActiveJob::from_message(&message, &received.receipt_handle);
        if let Ok(mut slot) = self.active.lock() {
            *slot = Some(job.clone());
        }
        if let Err(err) = self.jobs.put(&job, self.config.job_ttl).await {
            warn!(error = %err, "Active-job write failed; continuing");
        }

        // Background timers for the duration of the pipeline.
        let heartbeat_lost = Arc::new(AtomicBool::new(false));
        let extender = self.spawn_extender(received.receipt_handle.clone(), Arc::clone(&heartbeat_lost));
        let heartbeat = self.spawn_heartbeat(job.task_token.clone(), Arc::clone(&heartbeat_lost));

        let report = self.pipeline.run(&message).await;

        extender.abort();
        heartbeat.abort();

        // Terminal actions only while ownership is still held; a new
        // owner will receive this message again after visibility lapses.
        if !*owned.borrow() {
            info!(message_id = %message.message_id, "Ownership lost mid-pipeline; leaving message for redelivery");
            if let Ok(mut slot) = self.active.lock() {
                *slot = None;
            }
            return MessageEnd::Continue;
        }

        let outcome = if heartbeat_lost.load(Ordering::SeqCst)
            && report.outcome == Outcome::Preempted
        {
            // The abort came from the heartbeat watchdog, not a real
            // preemption.
            Outcome::Failed {
                reason: FailureReason::HeartbeatLost,
            }
        } else {
            report.outcome.clone()
        };

        match &outcome {
            Outcome::Completed => {
                send_success(self.gateway.as_ref(), &job.task_token, &report.success_payload()).await;
                self.delete_message(&received).await;
                self.delete_job(&job).await;
            }
            Outcome::Preempted => {
                send_failure(
                    self.gateway.as_ref(),
                    &job.task_token,
                    FailureReason::Preempted,
                    &serde_json::json!({
                        "commitSha": report.commit_sha,
                        "published": report.published,
                        "pushed": report.pushed,
                    })
                    .to_string(),
                )
                .await;
                self.delete_message(&received).await;
                self.delete_job(&job).await;
            }
            Outcome::Failed { reason } => {
                send_failure(
                    self.gateway.as_ref(),
                    &job.task_token,
                    *reason,
                    &report.failure_detail(),
                )
                .await;
                // Heartbeat loss leaves the message for redelivery once
                // visibility lapses; every other failure is terminal.
                if *reason != FailureReason::HeartbeatLost {
                    self.delete_message(&received).await;
                }
                self.delete_job(&job).await;
            }
        }

        if let Ok(mut slot) = self.active.lock() {
            *slot = None;
        }

        if report.auth_failure {
            error!("Git remote rejected credentials; surrendering claim");
            return MessageEnd::AuthFailure;
        }
        MessageEnd::Continue
    }

    async fn reject_malformed(
        &self,
        received: &ReceivedMessage,
        task_token: Option<&str>,
        owned: &watch::Receiver<bool>,
    ) -> MessageEnd {
        warn!(body_len = received.body.len(), "Rejecting malformed work message");
        if !*owned.borrow() {
            return MessageEnd::Continue;
        }
        if let Some(token) = task_token {
            send_failure(
                self.gateway.as_ref(),
                token,
                FailureReason::MalformedMessage,
                "work message failed validation",
            )
            .await;
        }
        self.delete_message(received).await;
        MessageEnd::Continue
    }

    async fn delete_message(&self, received: &ReceivedMessage) {
        if let Err(err) = self
            .queue
            .delete(&self.config.queue_url, &received.receipt_handle)
            .await
        {
            warn!(error = %err, "Work message delete failed");
        }
    }

    async fn delete_job(&self, job: &ActiveJob) {
        if let Err(err) = self.jobs.delete(&job.key).await {
            warn!(error = %err, "Active-job delete failed");
        }
    }

    fn spawn_extender(
        &self,
        receipt_handle: String,
        heartbeat_lost: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let queue_url = self.config.queue_url.clone();
        let period = self.config.visibility_extend_period;
        let timeout = self.config.visibility_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                if heartbeat_lost.load(Ordering::SeqCst) {
                    // Stop extending so the message is redelivered.
                    debug!("Heartbeat lost; visibility extender stopping");
                    return;
                }
                if let Err(err) = queue
                    .change_visibility(&queue_url, &receipt_handle, timeout)
                    .await
                {
                    warn!(error = %err, "Visibility extension failed");
                }
            }
        })
    }

    fn spawn_heartbeat(
        &self,
        task_token: String,
        heartbeat_lost: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(&self.gateway);
        let pipeline = Arc::clone(&self.pipeline);
        let period = self.config.heartbeat_period;
        let threshold = self.config.heartbeat_failure_threshold;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            let mut consecutive_failures = 0u32;
            loop {
                interval.tick().await;
                match gateway.heartbeat(&task_token).await {
                    Ok(()) => consecutive_failures = 0,
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!(
                            consecutive_failures,
                            error = %err,
                            "Heartbeat failed"
                        );
                        if consecutive_failures >= threshold {
                            error!("Heartbeat threshold exceeded; aborting job");
                            heartbeat_lost.store(true, Ordering::SeqCst);
                            pipeline.abort();
                            return;
                        }
                    }
                }
            }
        })
    }
}

enum MessageEnd {
    Continue,
    AuthFailure,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::MockCallbackGateway;
    use crate::queue::MockMessageQueue;
    use crate::store::MockActiveJobStore;
    use crate::types::WorkflowReport;
    use crate::workflow::MockPipeline;

    fn config() -> PumpConfig {
        PumpConfig {
            queue_url: "https://sqs.test/owned.fifo".to_string(),
            visibility_extend_period: Duration::from_secs(60),
            visibility_timeout: Duration::from_secs(180),
            heartbeat_period: Duration::from_secs(30),
            heartbeat_failure_threshold: 3,
            job_ttl: Duration::from_secs(3600),
        }
    }

    fn work_body() -> String {
        serde_json::json!({
            "taskToken": "T1",
            "messageId": "M1",
            "threadId": "abc",
            "projectId": "amelia",
            "userId": "scott",
            "repoUrl": "https://example.com/site.git",
            "instruction": "add a hero section",
        })
        .to_string()
    }

    fn owned_watch(value: bool) -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(value)
    }

    fn pump(
        queue: MockMessageQueue,
        jobs: MockActiveJobStore,
        gateway: MockCallbackGateway,
        pipeline: MockPipeline,
    ) -> (WorkPump, Arc<StdMutex<Option<ActiveJob>>>) {
        let active = Arc::new(StdMutex::new(None));
        let pump = WorkPump::new(
            Arc::new(queue),
            Arc::new(jobs),
            Arc::new(gateway),
            Arc::new(pipeline),
            Arc::clone(&active),
            config(),
        );
        (pump, active)
    }

    #[tokio::test]
    async fn test_completed_outcome_reports_success_and_deletes() {
        let mut queue = MockMessageQueue::new();
        queue
            .expect_delete()
            .withf(|_, receipt| receipt == "R1")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut jobs = MockActiveJobStore::new();
        jobs.expect_put().times(1).returning(|_, _| Ok(()));
        jobs.expect_delete().times(1).returning(|_| Ok(()));

        let mut gateway = MockCallbackGateway::new();
        gateway
            .expect_report_success()
            .withf(|token, _| token == "T1")
            .times(1)
            .returning(|_, _| Ok(()));
        gateway.expect_heartbeat().returning(|_| Ok(()));

        let mut pipeline = MockPipeline::new();
        pipeline.expect_run().times(1).returning(|_| {
            let mut report = WorkflowReport::empty(Outcome::Completed);
            report.pushed = true;
            report.published = true;
            report
        });

        let (pump, active) = pump(queue, jobs, gateway, pipeline);
        let (_owned_tx, owned) = owned_watch(true);

        let received = ReceivedMessage {
            body: work_body(),
            receipt_handle: "R1".to_string(),
        };
        // Drive one message directly; the outer loop is exercised in the
        // claim-manager tests.
        let end = pump.handle_message(received, &owned).await;
        assert!(matches!(end, MessageEnd::Continue));
        assert!(active.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preempted_outcome_reports_preempted() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().times(1).returning(|_, _| Ok(()));

        let mut jobs = MockActiveJobStore::new();
        jobs.expect_put().returning(|_, _| Ok(()));
        jobs.expect_delete().times(1).returning(|_| Ok(()));

        let mut gateway = MockCallbackGateway::new();
        gateway
            .expect_report_failure()
            .withf(|token, reason, _| token == "T1" && *reason == FailureReason::Preempted)
            .times(1)
            .returning(|_, _, _| Ok(()));
        gateway.expect_heartbeat().returning(|_| Ok(()));

        let mut pipeline = MockPipeline::new();
        pipeline
            .expect_run()
            .returning(|_| WorkflowReport::empty(Outcome::Preempted));

        let (pump, _active) = pump(queue, jobs, gateway, pipeline);
        let (_owned_tx, owned) = owned_watch(true);

        let received = ReceivedMessage {
            body: work_body(),
            receipt_handle: "R1".to_string(),
        };
        pump.handle_message(received, &owned).await;
    }

    #[tokio::test]
    async fn test_ownership_lost_suppresses_terminal_actions() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().never();

        let mut jobs = MockActiveJobStore::new();
        jobs.expect_put().returning(|_, _| Ok(()));
        jobs.expect_delete().never();

        let mut gateway = MockCallbackGateway::new();
        gateway.expect_report_success().never();
        gateway.expect_report_failure().never();
        gateway.expect_heartbeat().returning(|_| Ok(()));

        let (owned_tx, owned_rx) = watch::channel(true);
        let mut pipeline = MockPipeline::new();
        pipeline.expect_run().returning(move |_| {
            // Ownership evaporates while the pipeline runs.
            let _ = owned_tx.send(false);
            WorkflowReport::empty(Outcome::Completed)
        });

        let (pump, active) = pump(queue, jobs, gateway, pipeline);

        let received = ReceivedMessage {
            body: work_body(),
            receipt_handle: "R1".to_string(),
        };
        let end = pump.handle_message(received, &owned_rx).await;
        assert!(matches!(end, MessageEnd::Continue));
        assert!(active.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_deleted_with_failure_callback() {
        let mut queue = MockMessageQueue::new();
        queue
            .expect_delete()
            .withf(|_, receipt| receipt == "R9")
            .times(1)
            .returning(|_, _| Ok(()));

        let jobs = MockActiveJobStore::new();

        let mut gateway = MockCallbackGateway::new();
        gateway
            .expect_report_failure()
            .withf(|token, reason, _| {
                token == "T9" && *reason == FailureReason::MalformedMessage
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut pipeline = MockPipeline::new();
        pipeline.expect_run().never();

        let (pump, _active) = pump(queue, jobs, gateway, pipeline);
        let (_owned_tx, owned) = owned_watch(true);

        // repoUrl is null: deserialization fails but the token is
        // recoverable.
        let received = ReceivedMessage {
            body: serde_json::json!({
                "taskToken": "T9",
                "messageId": "M9",
                "threadId": "abc",
                "projectId": "amelia",
                "userId": "scott",
                "repoUrl": null,
                "instruction": "x",
            })
            .to_string(),
            receipt_handle: "R9".to_string(),
        };
        pump.handle_message(received, &owned).await;
    }

    #[tokio::test]
    async fn test_auth_failure_surrenders_claim() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().returning(|_, _| Ok(()));

        let mut jobs = MockActiveJobStore::new();
        jobs.expect_put().returning(|_, _| Ok(()));
        jobs.expect_delete().returning(|_| Ok(()));

        let mut gateway = MockCallbackGateway::new();
        gateway.expect_report_failure().returning(|_, _, _| Ok(()));
        gateway.expect_heartbeat().returning(|_| Ok(()));

        let mut pipeline = MockPipeline::new();
        pipeline.expect_run().returning(|_| {
            let mut report = WorkflowReport::empty(Outcome::Failed {
                reason: FailureReason::Internal,
            });
            report.auth_failure = true;
            report
        });

        let (pump, _active) = pump(queue, jobs, gateway, pipeline);
        let (_owned_tx, owned) = owned_watch(true);

        let received = ReceivedMessage {
            body: work_body(),
            receipt_handle: "R1".to_string(),
        };
        let end = pump.handle_message(received, &owned).await;
        assert!(matches!(end, MessageEnd::AuthFailure));
    }

    #[tokio::test]
    async fn test_active_job_visible_before_table_write() {
        // The in-memory slot must be set before the table write so the
        // preemption listener's lookup during the pickup window either
        // sees nothing or the fresh job.
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().returning(|_, _| Ok(()));

        let active = Arc::new(StdMutex::new(None::<ActiveJob>));
        let active_probe = Arc::clone(&active);

        let mut jobs = MockActiveJobStore::new();
        jobs.expect_put().times(1).returning(move |job, _| {
            let slot = active_probe.lock().unwrap();
            let in_memory = slot.as_ref().expect("slot must be set before table write");
            assert_eq!(in_memory.message_id, job.message_id);
            Ok(())
        });
        jobs.expect_delete().returning(|_| Ok(()));

        let mut gateway = MockCallbackGateway::new();
        gateway.expect_report_success().returning(|_, _| Ok(()));
        gateway.expect_heartbeat().returning(|_| Ok(()));

        let mut pipeline = MockPipeline::new();
        pipeline
            .expect_run()
            .returning(|_| WorkflowReport::empty(Outcome::Completed));

        let pump = WorkPump::new(
            Arc::new(queue),
            Arc::new(jobs),
            Arc::new(gateway),
            Arc::new(pipeline),
            Arc::clone(&active),
            config(),
        );
        let (_owned_tx, owned) = owned_watch(true);

        let received = ReceivedMessage {
            body: work_body(),
            receipt_handle: "R1".to_string(),
        };
        pump.handle_message(received, &owned).await;
    }
}
