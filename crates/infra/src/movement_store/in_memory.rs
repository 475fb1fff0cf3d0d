use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use stockledger_core::{ExpectedVersion, TenantId};
use stockledger_ledger::{BatchKey, MovementRecord};

use super::{LoadedStream, MovementStore, MovementStoreError, StoredMovement, validate_batch};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    key: BatchKey,
}

#[derive(Debug, Default)]
struct Inner {
    log: Vec<StoredMovement>,
    /// Indices into `log`, per stream, in sequence order.
    streams: HashMap<StreamKey, Vec<usize>>,
}

/// In-memory append-only movement store.
///
/// Intended for tests/dev and single-process deployments. The version check
/// and the push happen under one write lock, so concurrent appends to the same
/// stream are serialized and exactly one of two racing writers wins.
#[derive(Debug, Default)]
pub struct InMemoryMovementStore {
    inner: RwLock<Inner>,
}

impl InMemoryMovementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of movements held, across tenants.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> MovementStoreError {
    MovementStoreError::Backend("lock poisoned".to_string())
}

#[async_trait]
impl MovementStore for InMemoryMovementStore {
    async fn append(
        &self,
        tenant_id: TenantId,
        key: &BatchKey,
        movements: Vec<MovementRecord>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredMovement>, MovementStoreError> {
        if movements.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(tenant_id, key, &movements)?;

        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let stream_key = StreamKey {
            tenant_id,
            key: key.clone(),
        };
        let current = inner.streams.get(&stream_key).map(|s| s.len() as u64).unwrap_or(0);

        expected_version
            .check(current)
            .map_err(|e| MovementStoreError::Concurrency(format!("{key}: {e}")))?;

        let mut committed = Vec::with_capacity(movements.len());
        let mut next_seq = current + 1;
        for record in movements {
            let stored = StoredMovement {
                record,
                sequence_number: next_seq,
                position: inner.log.len() as u64 + 1,
            };
            let idx = inner.log.len();
            inner.log.push(stored.clone());
            inner.streams.entry(stream_key.clone()).or_default().push(idx);
            committed.push(stored);
            next_seq += 1;
        }

        Ok(committed)
    }

    async fn load_stream(&self, tenant_id: TenantId, key: &BatchKey) -> Result<LoadedStream, MovementStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let stream_key = StreamKey {
            tenant_id,
            key: key.clone(),
        };
        let movements: Vec<StoredMovement> = inner
            .streams
            .get(&stream_key)
            .map(|idxs| idxs.iter().map(|&i| inner.log[i].clone()).collect())
            .unwrap_or_default();
        Ok(LoadedStream {
            version: movements.len() as u64,
            movements,
        })
    }

    async fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredMovement>, MovementStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .log
            .iter()
            .filter(|m| m.record.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn head(&self, tenant_id: TenantId) -> Result<u64, MovementStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .log
            .iter()
            .rev()
            .find(|m| m.record.tenant_id == tenant_id)
            .map(|m| m.position)
            .unwrap_or(0))
    }
}
