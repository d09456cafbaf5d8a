// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Production backends for the worker's seams.
//!
//! SQS carries the three queues, DynamoDB the ownership and active-job
//! tables, S3 the published site, and Step Functions the task-token
//! callbacks. All clients share one resolved AWS config.

mod dynamo;
mod s3;
mod sfn;
mod sqs;

pub use dynamo::{DynamoActiveJobStore, DynamoOwnershipStore};
pub use s3::S3SitePublisher;
pub use sfn::SfnCallbackGateway;
pub use sqs::SqsQueue;

/// All AWS service clients the worker needs, built from the ambient
/// credential chain (environment, task role, profile).
#[derive(Clone)]
pub struct AwsClients {
    pub sqs: aws_sdk_sqs::Client,
    pub dynamodb: aws_sdk_dynamodb::Client,
    pub s3: aws_sdk_s3::Client,
    pub sfn: aws_sdk_sfn::Client,
}

impl AwsClients {
    /// Resolve the shared config and construct every client.
    pub async fn connect() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            sqs: aws_sdk_sqs::Client::new(&config),
            dynamodb: aws_sdk_dynamodb::Client::new(&config),
            s3: aws_sdk_s3::Client::new(&config),
            sfn: aws_sdk_sfn::Client::new(&config),
        }
    }
}
