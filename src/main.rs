// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! editd main entry point.
//!
//! Parse the environment-backed options, initialize tracing, wire the
//! AWS backends, and hand control to the claim manager until a shutdown
//! signal arrives.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use editd::aws::{
    AwsClients, DynamoActiveJobStore, DynamoOwnershipStore, S3SitePublisher, SfnCallbackGateway,
    SqsQueue,
};
use editd::claim::ClaimManager;
use editd::config::WorkerOptions;
use editd::telemetry::{init_telemetry, TelemetryConfig};
use editd::types::WorkerIdentity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = WorkerOptions::parse();
    let _guard = init_telemetry(&TelemetryConfig::default())?;

    let identity = WorkerIdentity::generate();
    info!(
        worker_id = %identity.worker_id,
        version = editd::VERSION,
        workspace_root = %options.workspace_root.display(),
        "Starting edit worker"
    );

    let clients = AwsClients::connect().await;
    let queue = Arc::new(SqsQueue::new(clients.sqs.clone()));
    let ownership = Arc::new(DynamoOwnershipStore::new(
        clients.dynamodb.clone(),
        &options.ownership_table,
    ));
    let jobs = Arc::new(DynamoActiveJobStore::new(
        clients.dynamodb.clone(),
        &options.active_job_table,
    ));
    let gateway = Arc::new(SfnCallbackGateway::new(clients.sfn.clone()));
    let publisher = Arc::new(S3SitePublisher::new(
        clients.s3.clone(),
        &options.site_bucket_pattern,
        &options.workspace_root,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let manager = ClaimManager::new(
        queue,
        ownership,
        jobs,
        gateway,
        publisher,
        options,
        identity,
    );
    manager.run(shutdown_rx).await;

    info!("Worker stopped");
    Ok(())
}

/// Flip the shutdown watch on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
