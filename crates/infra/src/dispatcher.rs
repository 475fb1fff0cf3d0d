//! Movement write pipeline.
//!
//! ```text
//! candidate
//!   ↓
//! 1. Validate shape (no store access for malformed input)
//!   ↓
//! 2. Load the batch stream (tenant-scoped)
//!   ↓
//! 3. Rehydrate BatchLedger
//!   ↓
//! 4. Decide (pure, may reject)
//!   ↓
//! 5. Append with ExpectedVersion::Exact(loaded version)
//!   ↓
//! 6. Publish committed movements on the bus
//! ```
//!
//! A `Concurrency` failure at step 5 means nothing was written, so the
//! pipeline goes back to step 2 and decides again against the fresh stream.
//! Two racing issues against the same batch are serialized this way and can
//! never both pass the stock check. Any other store failure is returned as-is:
//! the write may or may not have landed.

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use stockledger_core::{Aggregate, ExpectedVersion, MovementId, TenantId, UserId};
use stockledger_events::{Event, EventBus, EventEnvelope, InMemoryEventBus};
use stockledger_ledger::{
    BatchKey, BatchLedger, LedgerCommand, LedgerError, LedgerEvent, MovementCandidate,
    MovementRecord, RecordMovement, ReverseMovement,
};

use crate::movement_store::{MovementStore, MovementStoreError, StoredMovement};

/// Envelope carried on the bus for each committed movement.
pub type MovementEnvelope = EventEnvelope<LedgerEvent>;

/// The in-process bus used to fan committed movements out to caches.
pub type MovementBus = InMemoryEventBus<MovementEnvelope>;

pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The ledger refused the movement. Nothing was written.
    #[error(transparent)]
    Rejected(#[from] LedgerError),

    /// Still conflicting after the retry budget was spent.
    #[error("batch stream kept changing under {attempts} attempts: {message}")]
    Concurrency { attempts: u32, message: String },

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error(transparent)]
    Store(MovementStoreError),
}

impl From<MovementStoreError> for DispatchError {
    fn from(value: MovementStoreError) -> Self {
        match value {
            MovementStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg),
            other => DispatchError::Store(other),
        }
    }
}

#[derive(Debug)]
pub struct LedgerDispatcher<S, B> {
    store: S,
    bus: B,
    conflict_retries: u32,
}

impl<S, B> LedgerDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> LedgerDispatcher<S, B>
where
    S: MovementStore,
    B: EventBus<MovementEnvelope>,
{
    /// Record a receipt or issue. Returns the committed movement.
    #[instrument(skip(self, candidate), fields(tenant_id = %tenant_id, location_id = %candidate.location_id, batch_id = %candidate.batch_id))]
    pub async fn record_movement(
        &self,
        tenant_id: TenantId,
        candidate: MovementCandidate,
    ) -> Result<MovementRecord, DispatchError> {
        let (key, _, _) = candidate.validate()?;
        let command = LedgerCommand::Record(RecordMovement {
            tenant_id,
            movement_id: MovementId::new(),
            candidate,
            occurred_at: Utc::now(),
        });
        self.dispatch(tenant_id, &key, &command).await
    }

    /// Cancel `target` with an opposite-direction movement of the same quantity.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, stream = %key, target = %target))]
    pub async fn reverse_movement(
        &self,
        tenant_id: TenantId,
        key: BatchKey,
        target: MovementId,
        operator_id: Option<UserId>,
        reason: Option<String>,
    ) -> Result<MovementRecord, DispatchError> {
        if key.location_id.is_empty() || key.batch_id.is_empty() {
            return Err(LedgerError::validation("location_id and batch_id are required").into());
        }
        let command = LedgerCommand::Reverse(ReverseMovement {
            tenant_id,
            key: key.clone(),
            target,
            reversal_id: MovementId::new(),
            operator_id,
            reason,
            occurred_at: Utc::now(),
        });
        self.dispatch(tenant_id, &key, &command).await
    }

    /// Load, rehydrate, decide, append; retry on version conflicts.
    ///
    /// The command (including its movement id and timestamp) is built once,
    /// so a retried decision records the same movement.
    async fn dispatch(
        &self,
        tenant_id: TenantId,
        key: &BatchKey,
        command: &LedgerCommand,
    ) -> Result<MovementRecord, DispatchError> {
        let attempts = self.conflict_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_once(tenant_id, key, command).await {
                Err(DispatchError::Store(MovementStoreError::Concurrency(message))) => {
                    if attempt >= attempts {
                        warn!(stream = %key, attempts, "giving up after repeated conflicts");
                        return Err(DispatchError::Concurrency { attempts, message });
                    }
                    warn!(stream = %key, attempt, %message, "append conflicted, re-deciding");
                }
                Err(e) => return Err(e),
                Ok(committed) => return self.finish(tenant_id, key, committed),
            }
        }
    }

    async fn try_once(
        &self,
        tenant_id: TenantId,
        key: &BatchKey,
        command: &LedgerCommand,
    ) -> Result<Vec<StoredMovement>, DispatchError> {
        let stream = self.store.load_stream(tenant_id, key).await?;

        let mut ledger = BatchLedger::empty(tenant_id, key.clone());
        for stored in &stream.movements {
            if stored.record.tenant_id != tenant_id {
                return Err(DispatchError::TenantIsolation(format!(
                    "stream {key} returned a movement of another tenant"
                )));
            }
            ledger.apply(&LedgerEvent::MovementRecorded(stored.record.clone()));
        }
        let version = stream.version;

        let events = ledger.handle(command)?;
        let records = events.into_iter().map(LedgerEvent::into_record).collect();

        Ok(self
            .store
            .append(tenant_id, key, records, ExpectedVersion::Exact(version))
            .await?)
    }

    fn finish(
        &self,
        tenant_id: TenantId,
        key: &BatchKey,
        committed: Vec<StoredMovement>,
    ) -> Result<MovementRecord, DispatchError> {
        let stream = key.stream_name();
        let mut last = None;

        for stored in committed {
            let record = stored.record;
            let event = LedgerEvent::MovementRecorded(record.clone());
            info!(
                tenant_id = %tenant_id,
                stream = %stream,
                event_type = event.event_type(),
                movement_id = %record.id,
                direction = %record.direction,
                quantity = %record.quantity,
                sequence_number = stored.sequence_number,
                "movement recorded"
            );

            let envelope = EventEnvelope::new(
                Uuid::now_v7(),
                tenant_id,
                stream.clone(),
                stored.sequence_number,
                event,
            );
            if let Err(e) = self.bus.publish(envelope) {
                warn!(stream = %stream, movement_id = %record.id, error = ?e, "publish failed after commit");
            }
            last = Some(record);
        }

        last.ok_or_else(|| {
            DispatchError::Store(MovementStoreError::InvalidAppend(
                "append committed no movements".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::movement_store::{InMemoryMovementStore, LoadedStream};

    fn dispatcher() -> LedgerDispatcher<Arc<InMemoryMovementStore>, Arc<MovementBus>> {
        LedgerDispatcher::new(Arc::new(InMemoryMovementStore::new()), Arc::new(MovementBus::new()))
    }

    #[tokio::test]
    async fn publishes_committed_movement() {
        let d = dispatcher();
        let sub = d.bus().subscribe();
        let tenant = TenantId::new();

        let rec = d
            .record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(100)))
            .await
            .unwrap();

        let envelope = sub.try_recv().unwrap();
        assert_eq!(envelope.stream(), "CR-1/B1");
        assert_eq!(envelope.sequence_number(), 1);
        assert_eq!(envelope.payload().record().id, rec.id);
    }

    #[tokio::test]
    async fn malformed_candidate_never_reaches_the_store() {
        let d = dispatcher();
        let tenant = TenantId::new();

        let err = d
            .record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(LedgerError::InvalidQuantity(_))));
        assert!(d.store().is_empty());
    }

    #[tokio::test]
    async fn reversal_of_receipt_respects_stock() {
        let d = dispatcher();
        let tenant = TenantId::new();
        let key = BatchKey::new("CR-1", "B1");

        let receipt = d
            .record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(50)))
            .await
            .unwrap();
        d.record_movement(tenant, MovementCandidate::issue("CR-1", "B1", dec!(10)))
            .await
            .unwrap();

        let err = d
            .reverse_movement(tenant, key, receipt.id, None, Some("miscount".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Rejected(LedgerError::InsufficientStock { .. })
        ));
        assert_eq!(d.store().len(), 2);
    }

    /// Wraps a store and forces the first `n` appends to conflict.
    struct Flaky {
        inner: InMemoryMovementStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait]
    impl MovementStore for Flaky {
        async fn append(
            &self,
            tenant_id: TenantId,
            key: &BatchKey,
            movements: Vec<MovementRecord>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredMovement>, MovementStoreError> {
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MovementStoreError::Concurrency("forced".into()));
            }
            self.inner.append(tenant_id, key, movements, expected_version).await
        }

        async fn load_stream(&self, tenant_id: TenantId, key: &BatchKey) -> Result<LoadedStream, MovementStoreError> {
            self.inner.load_stream(tenant_id, key).await
        }

        async fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredMovement>, MovementStoreError> {
            self.inner.load_tenant(tenant_id).await
        }

        async fn head(&self, tenant_id: TenantId) -> Result<u64, MovementStoreError> {
            self.inner.head(tenant_id).await
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_within_budget() {
        let store = Flaky {
            inner: InMemoryMovementStore::new(),
            conflicts_left: AtomicU32::new(2),
        };
        let d = LedgerDispatcher::new(store, MovementBus::new()).with_conflict_retries(2);
        let tenant = TenantId::new();

        d.record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(5)))
            .await
            .unwrap();
        assert_eq!(d.store().inner.len(), 1);
    }

    #[tokio::test]
    async fn conflicts_beyond_budget_surface() {
        let store = Flaky {
            inner: InMemoryMovementStore::new(),
            conflicts_left: AtomicU32::new(5),
        };
        let d = LedgerDispatcher::new(store, MovementBus::new()).with_conflict_retries(1);
        let tenant = TenantId::new();

        let err = d
            .record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency { attempts: 2, .. }));
        assert!(d.store().inner.is_empty());
    }

    /// Hides the newest movement of every stream, the way the Postgres store
    /// skips a row it cannot decode, while still reporting the full version.
    struct UndecodableTail(InMemoryMovementStore);

    #[async_trait]
    impl MovementStore for UndecodableTail {
        async fn append(
            &self,
            tenant_id: TenantId,
            key: &BatchKey,
            movements: Vec<MovementRecord>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredMovement>, MovementStoreError> {
            self.0.append(tenant_id, key, movements, expected_version).await
        }

        async fn load_stream(&self, tenant_id: TenantId, key: &BatchKey) -> Result<LoadedStream, MovementStoreError> {
            let mut stream = self.0.load_stream(tenant_id, key).await?;
            stream.movements.pop();
            Ok(stream)
        }

        async fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredMovement>, MovementStoreError> {
            self.0.load_tenant(tenant_id).await
        }

        async fn head(&self, tenant_id: TenantId) -> Result<u64, MovementStoreError> {
            self.0.head(tenant_id).await
        }
    }

    #[tokio::test]
    async fn undecodable_newest_row_does_not_block_the_batch() {
        let d = LedgerDispatcher::new(UndecodableTail(InMemoryMovementStore::new()), MovementBus::new())
            .with_conflict_retries(0);
        let tenant = TenantId::new();

        d.record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(100)))
            .await
            .unwrap();
        d.record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(5)))
            .await
            .unwrap();
        let issued = d
            .record_movement(tenant, MovementCandidate::issue("CR-1", "B1", dec!(40)))
            .await
            .unwrap();

        assert_eq!(issued.quantity, dec!(40));
        assert_eq!(d.store().0.len(), 3);
    }
}
