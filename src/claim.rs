// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Claim manager: binds this worker to one `(project, user)` at a time.
//!
//! The worker polls the cluster-wide unclaimed queue until it wins a
//! conditional write on the ownership table, then supervises the work
//! pump and preemption listener for the owned pair while refreshing the
//! lease on a period well under its duration. Losing a refresh condition
//! means another worker took over: in-flight work is aborted without any
//! terminal callbacks (the new owner will see the message again) and the
//! manager goes back to polling.
//!
//! Ordering: the pumps never start before the ownership record is
//! written, and the record is never left behind once the pumps have
//! stopped.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackGateway;
use crate::config::WorkerOptions;
use crate::publish::SitePublisher;
use crate::pump::{PumpConfig, PumpEnd, WorkPump};
use crate::preempt::PreemptListener;
use crate::queue::{MessageQueue, ReceivedMessage};
use crate::store::{ActiveJobStore, OwnershipStore};
use crate::types::{ClaimRequest, OwnerKey, WorkerIdentity};
use crate::workflow::{Pipeline, RunnerConfig, WorkflowRunner};

/// Long-poll wait per receive call.
const RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// Re-claim backoff bounds after a lost lease.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How an owned period ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnedEnd {
    /// The lease refresh lost its condition; the record belongs to
    /// someone else now.
    LeaseLost,
    /// Graceful shutdown; the record was released.
    Shutdown,
    /// The claim was surrendered (auth failure); the record was
    /// released.
    Released,
}

/// The claim manager.
pub struct ClaimManager {
    queue: Arc<dyn MessageQueue>,
    ownership: Arc<dyn OwnershipStore>,
    jobs: Arc<dyn ActiveJobStore>,
    gateway: Arc<dyn CallbackGateway>,
    publisher: Arc<dyn SitePublisher>,
    options: WorkerOptions,
    identity: WorkerIdentity,
}

impl ClaimManager {
    /// Create a claim manager.
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        ownership: Arc<dyn OwnershipStore>,
        jobs: Arc<dyn ActiveJobStore>,
        gateway: Arc<dyn CallbackGateway>,
        publisher: Arc<dyn SitePublisher>,
        options: WorkerOptions,
        identity: WorkerIdentity,
    ) -> Self {
        Self {
            queue,
            ownership,
            jobs,
            gateway,
            publisher,
            options,
            identity,
        }
    }

    /// Run until shutdown: poll for claims, own pairs, release.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = BACKOFF_BASE;
        info!(worker_id = %self.identity.worker_id, "Worker entering claim loop");

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested; leaving claim loop");
                return;
            }

            let received = tokio::select! {
                result = self.queue.receive(&self.options.unclaimed_queue_url, RECEIVE_WAIT) => {
                    match result {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(error = %err, "Unclaimed queue receive failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                _ = shutdown.changed() => continue,
            };

            let Some(received) = received else { continue };

            match self.process_claim(received, &mut shutdown).await {
                Some(OwnedEnd::Shutdown) => return,
                Some(OwnedEnd::LeaseLost) => {
                    warn!(delay = ?backoff, "Lease lost; backing off before re-claiming");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Some(OwnedEnd::Released) => {
                    backoff = BACKOFF_BASE;
                }
                None => {}
            }
        }
    }

    /// Attempt one claim. Returns how the owned period ended, or `None`
    /// when the claim was not acquired.
    async fn process_claim(
        &self,
        received: ReceivedMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<OwnedEnd> {
        let request: ClaimRequest = match serde_json::from_str(&received.body) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Dropping malformed claim request");
                self.delete_unclaimed(&received.receipt_handle).await;
                return None;
            }
        };
        if request.kind != "claim_request" {
            warn!(kind = %request.kind, "Dropping claim message with unexpected type");
            self.delete_unclaimed(&received.receipt_handle).await;
            return None;
        }

        let key = request.owner_key();
        let expires = Utc::now() + self.options.lease_duration();
        match self
            .ownership
            .try_claim(&key, &self.identity.worker_id, expires)
            .await
        {
            Ok(()) => {
                info!(owner = %key, "Claim acquired");
                self.delete_unclaimed(&received.receipt_handle).await;
                let end = self.run_owned(key, request.queue_url, shutdown).await;
                Some(end)
            }
            Err(err) if err.is_condition_failed() => {
                debug!(owner = %key, "Claim lost to another worker");
                self.return_unclaimed(&received.receipt_handle).await;
                None
            }
            Err(err) => {
                warn!(owner = %key, error = %err, "Claim write failed");
                self.return_unclaimed(&received.receipt_handle).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                None
            }
        }
    }

    /// Supervise the pumps for an owned pair until the lease is lost,
    /// shutdown arrives, or the claim is surrendered.
    async fn run_owned(
        &self,
        key: OwnerKey,
        work_queue_url: String,
        shutdown: &mut watch::Receiver<bool>,
    ) -> OwnedEnd {
        let (owned_tx, owned_rx) = watch::channel(true);

        let runner: Arc<dyn Pipeline> = Arc::new(WorkflowRunner::new(
            RunnerConfig::from(&self.options),
            Arc::clone(&self.publisher),
        ));
        let active = Arc::new(StdMutex::new(None));

        let pump = WorkPump::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.jobs),
            Arc::clone(&self.gateway),
            Arc::clone(&runner),
            Arc::clone(&active),
            PumpConfig {
                queue_url: work_queue_url,
                visibility_extend_period: self.options.visibility_extend_period(),
                visibility_timeout: Duration::from_secs(self.options.visibility_timeout_secs),
                heartbeat_period: self.options.heartbeat_period(),
                heartbeat_failure_threshold: self.options.heartbeat_failure_threshold,
                job_ttl: Duration::from_secs(self.options.visibility_timeout_secs * 4),
            },
        );
        let listener = PreemptListener::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.jobs),
            Arc::clone(&runner),
            Arc::clone(&active),
            key.clone(),
            self.options.interrupt_queue_url(&key),
            self.options.abort_grace_period() * 2,
        );

        let mut pump_task = {
            let owned = owned_rx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pump.run(owned, shutdown).await })
        };
        let mut listener_task = {
            let owned = owned_rx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(owned, shutdown).await })
        };

        let mut refresh = tokio::time::interval(self.options.lease_refresh_period());
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh.tick().await; // the first tick fires immediately

        let mut pump_joined = false;
        let end = loop {
            tokio::select! {
                _ = refresh.tick() => {
                    let expires = Utc::now() + self.options.lease_duration();
                    match self
                        .ownership
                        .refresh(&key, &self.identity.worker_id, expires)
                        .await
                    {
                        Ok(()) => debug!(owner = %key, "Lease refreshed"),
                        Err(err) if err.is_condition_failed() => {
                            error!(owner = %key, "Lease lost to another worker");
                            break OwnedEnd::LeaseLost;
                        }
                        Err(err) => {
                            // The lease holds until its expiry; try again
                            // next tick.
                            warn!(owner = %key, error = %err, "Lease refresh failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(owner = %key, "Shutdown requested; releasing claim");
                        break OwnedEnd::Shutdown;
                    }
                }
                result = &mut pump_task => {
                    pump_joined = true;
                    match result {
                        Ok(PumpEnd::AuthFailure) => break OwnedEnd::Released,
                        Ok(PumpEnd::Shutdown) => break OwnedEnd::Shutdown,
                        Ok(PumpEnd::LeaseLost) => break OwnedEnd::LeaseLost,
                        Err(err) => {
                            error!(owner = %key, error = %err, "Work pump task failed");
                            break OwnedEnd::Released;
                        }
                    }
                }
            }
        };

        // Stop the pumps: abort in-flight work, drop the owned flag so
        // no further terminal actions fire, then wait a bounded period.
        runner.abort();
        let _ = owned_tx.send(false);

        let grace = self.options.abort_grace_period() + Duration::from_secs(5);
        if !pump_joined && timeout(grace, &mut pump_task).await.is_err() {
            warn!(owner = %key, "Work pump did not stop in time; aborting task");
            pump_task.abort();
        }
        if timeout(grace, &mut listener_task).await.is_err() {
            warn!(owner = %key, "Preemption listener did not stop in time; aborting task");
            listener_task.abort();
        }

        match end {
            OwnedEnd::LeaseLost => {
                // The record is no longer ours to delete.
            }
            OwnedEnd::Shutdown | OwnedEnd::Released => {
                if let Err(err) = self
                    .ownership
                    .release(&key, &self.identity.worker_id)
                    .await
                {
                    warn!(owner = %key, error = %err, "Ownership release failed");
                }
                info!(owner = %key, "Claim released");
            }
        }

        end
    }

    async fn delete_unclaimed(&self, receipt_handle: &str) {
        if let Err(err) = self
            .queue
            .delete(&self.options.unclaimed_queue_url, receipt_handle)
            .await
        {
            warn!(error = %err, "Unclaimed-queue delete failed");
        }
    }

    /// Return a claim request to the queue for another worker.
    async fn return_unclaimed(&self, receipt_handle: &str) {
        if let Err(err) = self
            .queue
            .change_visibility(
                &self.options.unclaimed_queue_url,
                receipt_handle,
                Duration::ZERO,
            )
            .await
        {
            warn!(error = %err, "Unclaimed-queue visibility reset failed");
        }
    }
}
