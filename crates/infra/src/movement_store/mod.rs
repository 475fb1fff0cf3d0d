//! Append-only movement store boundary.
//!
//! The log is partitioned into streams keyed by `(tenant_id, BatchKey)`. Each
//! stream numbers its movements 1, 2, ... (`sequence_number`); the store also
//! assigns a store-wide `position` so a tenant's whole log can be read back in
//! append order.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockledger_core::{ExpectedVersion, TenantId};
use stockledger_ledger::{BatchKey, MovementRecord};

pub use in_memory::InMemoryMovementStore;
pub use postgres::PostgresMovementStore;

/// A movement as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMovement {
    pub record: MovementRecord,
    /// Position within the batch stream, starting at 1.
    pub sequence_number: u64,
    /// Store-wide append order.
    pub position: u64,
}

/// One batch stream as read back for a decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedStream {
    /// Decodable movements in sequence order.
    pub movements: Vec<StoredMovement>,
    /// Highest `sequence_number` in the stream, including rows that could not
    /// be decoded. This is the version an append must expect.
    pub version: u64,
}

impl LoadedStream {
    pub fn len(&self) -> usize {
        self.movements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.movements.is_empty()
    }
}

/// Movement store failure.
///
/// These are infrastructure errors; ledger rejections never reach the store.
#[derive(Debug, Error)]
pub enum MovementStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Backend unreachable or failing (network, pool, timeout). Whether an
    /// in-flight append landed is unknown, so callers must not blindly retry.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Append-only, tenant-scoped movement store.
///
/// Implementations must:
/// - check `expected_version` against the stream and append atomically (all
///   movements of a call or none)
/// - reject batches mixing tenants or streams
/// - never expose another tenant's movements
#[async_trait]
pub trait MovementStore: Send + Sync {
    /// Append movements to one batch stream.
    async fn append(
        &self,
        tenant_id: TenantId,
        key: &BatchKey,
        movements: Vec<MovementRecord>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredMovement>, MovementStoreError>;

    /// Load one batch stream in sequence order, with its version.
    async fn load_stream(&self, tenant_id: TenantId, key: &BatchKey) -> Result<LoadedStream, MovementStoreError>;

    /// Load a tenant's entire log in append order.
    async fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredMovement>, MovementStoreError>;

    /// Highest `position` written for the tenant (0 if none). Cheap staleness check.
    async fn head(&self, tenant_id: TenantId) -> Result<u64, MovementStoreError>;
}

#[async_trait]
impl<S> MovementStore for Arc<S>
where
    S: MovementStore + ?Sized,
{
    async fn append(
        &self,
        tenant_id: TenantId,
        key: &BatchKey,
        movements: Vec<MovementRecord>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredMovement>, MovementStoreError> {
        (**self).append(tenant_id, key, movements, expected_version).await
    }

    async fn load_stream(&self, tenant_id: TenantId, key: &BatchKey) -> Result<LoadedStream, MovementStoreError> {
        (**self).load_stream(tenant_id, key).await
    }

    async fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredMovement>, MovementStoreError> {
        (**self).load_tenant(tenant_id).await
    }

    async fn head(&self, tenant_id: TenantId) -> Result<u64, MovementStoreError> {
        (**self).head(tenant_id).await
    }
}

/// Checks shared by every backend before touching storage.
pub(crate) fn validate_batch(
    tenant_id: TenantId,
    key: &BatchKey,
    movements: &[MovementRecord],
) -> Result<(), MovementStoreError> {
    for (idx, m) in movements.iter().enumerate() {
        if m.tenant_id != tenant_id {
            return Err(MovementStoreError::TenantIsolation(format!(
                "batch contains a foreign tenant_id (index {idx})"
            )));
        }
        if &m.key() != key {
            return Err(MovementStoreError::InvalidAppend(format!(
                "movement at index {idx} belongs to {}, not {key}",
                m.key()
            )));
        }
    }
    Ok(())
}
