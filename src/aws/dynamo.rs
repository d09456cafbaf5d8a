// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! DynamoDB-backed ownership and active-job tables.
//!
//! Claim exclusivity rests on condition expressions: a claim only lands
//! when no live record exists (or the incumbent's lease expired), and a
//! refresh or release only lands while this worker is still the owner.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::StateError;
use crate::store::{ActiveJobStore, OwnershipStore};
use crate::types::{ActiveJob, OwnerKey};

/// Ownership table client.
#[derive(Clone)]
pub struct DynamoOwnershipStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoOwnershipStore {
    /// Bind to a table.
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl OwnershipStore for DynamoOwnershipStore {
    async fn try_claim(
        &self,
        key: &OwnerKey,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let now = Utc::now().timestamp();
        self.client
            .put_item()
            .table_name(&self.table)
            .item("pk", AttributeValue::S(key.partition_key()))
            .item("ownerWorkerId", AttributeValue::S(worker_id.to_string()))
            .item("acquiredAt", AttributeValue::N(now.to_string()))
            .item("refreshedAt", AttributeValue::N(now.to_string()))
            .item(
                "leaseExpiresAt",
                AttributeValue::N(lease_expires_at.timestamp().to_string()),
            )
            .condition_expression("attribute_not_exists(pk) OR leaseExpiresAt < :now")
            .expression_attribute_values(":now", AttributeValue::N(now.to_string()))
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    StateError::ConditionFailed
                } else {
                    StateError::Backend(service.to_string())
                }
            })?;
        Ok(())
    }

    async fn refresh(
        &self,
        key: &OwnerKey,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let now = Utc::now().timestamp();
        self.client
            .update_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(key.partition_key()))
            .update_expression("SET refreshedAt = :now, leaseExpiresAt = :expires")
            .condition_expression("attribute_exists(pk) AND ownerWorkerId = :me")
            .expression_attribute_values(":now", AttributeValue::N(now.to_string()))
            .expression_attribute_values(
                ":expires",
                AttributeValue::N(lease_expires_at.timestamp().to_string()),
            )
            .expression_attribute_values(":me", AttributeValue::S(worker_id.to_string()))
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    StateError::ConditionFailed
                } else {
                    StateError::Backend(service.to_string())
                }
            })?;
        Ok(())
    }

    async fn release(&self, key: &OwnerKey, worker_id: &str) -> Result<(), StateError> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(key.partition_key()))
            .condition_expression("ownerWorkerId = :me")
            .expression_attribute_values(":me", AttributeValue::S(worker_id.to_string()))
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    // Someone else owns the record; releasing it is not
                    // our place, and not an error.
                    Ok(())
                } else {
                    Err(StateError::Backend(service.to_string()))
                }
            }
        }
    }
}

/// Active-job table client.
#[derive(Clone)]
pub struct DynamoActiveJobStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoActiveJobStore {
    /// Bind to a table.
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl ActiveJobStore for DynamoActiveJobStore {
    async fn put(&self, job: &ActiveJob, ttl: Duration) -> Result<(), StateError> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.client
            .put_item()
            .table_name(&self.table)
            .item("pk", AttributeValue::S(job.key.partition_key()))
            .item("project", AttributeValue::S(job.key.project.clone()))
            .item("user", AttributeValue::S(job.key.user.clone()))
            .item("messageId", AttributeValue::S(job.message_id.clone()))
            .item("taskToken", AttributeValue::S(job.task_token.clone()))
            .item(
                "receiptHandle",
                AttributeValue::S(job.receipt_handle.clone()),
            )
            .item("threadId", AttributeValue::S(job.thread_id.clone()))
            .item(
                "startedAt",
                AttributeValue::N(job.started_at.timestamp().to_string()),
            )
            .item("ttl", AttributeValue::N(expires.to_string()))
            .send()
            .await
            .map_err(|err| StateError::Backend(err.into_service_error().to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &OwnerKey) -> Result<Option<ActiveJob>, StateError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(key.partition_key()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|err| StateError::Backend(err.into_service_error().to_string()))?;

        let Some(item) = output.item() else {
            return Ok(None);
        };

        let string_attr = |name: &str| -> Result<String, StateError> {
            item.get(name)
                .and_then(|v| v.as_s().ok())
                .cloned()
                .ok_or_else(|| StateError::Backend(format!("missing attribute {name}")))
        };

        let started_at = item
            .get("startedAt")
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        Ok(Some(ActiveJob {
            key: key.clone(),
            message_id: string_attr("messageId")?,
            task_token: string_attr("taskToken")?,
            receipt_handle: string_attr("receiptHandle")?,
            thread_id: string_attr("threadId")?,
            started_at,
        }))
    }

    async fn delete(&self, key: &OwnerKey) -> Result<(), StateError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(key.partition_key()))
            .send()
            .await
            .map_err(|err| StateError::Backend(err.into_service_error().to_string()))?;
        Ok(())
    }
}
