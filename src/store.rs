// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! State-table seams: ownership and active-job records.
//!
//! Both tables are keyed by the owner's partition key. Mutual exclusion
//! across workers comes entirely from the conditional-write semantics of
//! [`OwnershipStore`]: a claim or refresh that loses its condition returns
//! [`StateError::ConditionFailed`] rather than silently overwriting.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StateError;
use crate::types::{ActiveJob, OwnerKey};

/// Ownership table: at most one live record per `(project, user)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Conditionally create the ownership record for `key`.
    ///
    /// Succeeds iff no record exists or the existing record's lease has
    /// expired. Losing the condition is [`StateError::ConditionFailed`],
    /// not a backend fault.
    async fn try_claim(
        &self,
        key: &OwnerKey,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StateError>;

    /// Conditionally extend the lease; the condition is that `worker_id`
    /// still owns the record. A failed condition means the lease was
    /// lost.
    async fn refresh(
        &self,
        key: &OwnerKey,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StateError>;

    /// Delete the record if `worker_id` still owns it. Releasing a
    /// record someone else took over is a no-op.
    async fn release(&self, key: &OwnerKey, worker_id: &str) -> Result<(), StateError>;
}

/// Active-job table: the zero-or-one in-flight instruction per owner.
///
/// Records carry a TTL so a crashed worker's entry expires on its own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActiveJobStore: Send + Sync {
    /// Write the in-flight record with the given TTL.
    async fn put(&self, job: &ActiveJob, ttl: Duration) -> Result<(), StateError>;

    /// Load the in-flight record, if any.
    async fn get(&self, key: &OwnerKey) -> Result<Option<ActiveJob>, StateError>;

    /// Remove the in-flight record.
    async fn delete(&self, key: &OwnerKey) -> Result<(), StateError>;
}
