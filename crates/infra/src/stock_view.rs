//! Tenant-keyed cache of the stock projection.
//!
//! The movement store is the source of truth. A `StockSnapshot` is a disposable
//! copy of one tenant's log plus the projection computed from it, tagged with
//! the store `head` it reflects. Nothing here polls: callers `refresh` (pull),
//! `invalidate` after their own writes, or `drain_notifications` from a bus
//! subscription. The API decides how often `refresh_known` runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use stockledger_core::TenantId;
use stockledger_events::Subscription;
use stockledger_ledger::{
    BatchStock, MovementFilter, MovementRecord, StockProjection, StockQuery, StockTotals,
    project_stock,
};

use crate::dispatcher::MovementEnvelope;
use crate::movement_store::{MovementStore, MovementStoreError};

/// One tenant's log and its projection at a point in time.
#[derive(Debug, Clone)]
pub struct StockSnapshot {
    pub tenant_id: TenantId,
    /// Log in append order.
    pub movements: Vec<MovementRecord>,
    /// Every batch, depleted ones included.
    pub projection: StockProjection,
    /// Store position the snapshot reflects.
    pub head: u64,
    pub refreshed_at: DateTime<Utc>,
}

impl StockSnapshot {
    pub fn stock(&self, query: &StockQuery) -> Vec<BatchStock> {
        query.run(&self.movements).into_vec()
    }

    pub fn history(&self, filter: &MovementFilter) -> Vec<MovementRecord> {
        filter.apply(&self.movements).into_iter().cloned().collect()
    }

    /// Batches at `location_id` that can still be issued from.
    pub fn available(&self, location_id: &str) -> Vec<BatchStock> {
        self.stock(&StockQuery::available_at(location_id))
    }

    pub fn totals(&self) -> StockTotals {
        self.projection.totals()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    snapshots: HashMap<TenantId, Arc<StockSnapshot>>,
    /// Bumped by every invalidation. A refresh that started under an older
    /// generation must not install its snapshot.
    generations: HashMap<TenantId, u64>,
}

impl CacheState {
    fn generation(&self, tenant_id: TenantId) -> u64 {
        self.generations.get(&tenant_id).copied().unwrap_or(0)
    }
}

pub struct StockView<S> {
    store: S,
    cache: RwLock<CacheState>,
    /// Tenants ever loaded; `refresh_known` keeps these warm.
    known: RwLock<HashSet<TenantId>>,
    subscription: Mutex<Option<Subscription<MovementEnvelope>>>,
}

impl<S> StockView<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: RwLock::new(CacheState::default()),
            known: RwLock::new(HashSet::new()),
            subscription: Mutex::new(None),
        }
    }

    /// Listen for committed movements; see `drain_notifications`.
    pub fn attach(&self, subscription: Subscription<MovementEnvelope>) {
        if let Ok(mut slot) = self.subscription.lock() {
            *slot = Some(subscription);
        }
    }

    /// Drop the cached snapshot so the next read recomputes.
    pub fn invalidate(&self, tenant_id: TenantId) {
        if let Ok(mut cache) = self.cache.write() {
            cache.snapshots.remove(&tenant_id);
            *cache.generations.entry(tenant_id).or_default() += 1;
        }
    }

    /// Cached snapshot without touching the store.
    pub fn cached(&self, tenant_id: TenantId) -> Option<Arc<StockSnapshot>> {
        self.cache.read().ok()?.snapshots.get(&tenant_id).cloned()
    }

    fn generation(&self, tenant_id: TenantId) -> u64 {
        self.cache.read().map(|c| c.generation(tenant_id)).unwrap_or(0)
    }

    /// Install `snapshot` unless the tenant was invalidated after `generation`
    /// was read or a newer snapshot is already cached.
    fn install(&self, snapshot: &Arc<StockSnapshot>, generation: u64) -> bool {
        let Ok(mut cache) = self.cache.write() else {
            return false;
        };
        let tenant_id = snapshot.tenant_id;
        if cache.generation(tenant_id) != generation {
            return false;
        }
        if cache.snapshots.get(&tenant_id).is_some_and(|c| c.head > snapshot.head) {
            return false;
        }
        cache.snapshots.insert(tenant_id, snapshot.clone());
        true
    }

    /// Invalidate every tenant that received movements since the last drain.
    /// Returns the number of notifications consumed.
    pub fn drain_notifications(&self) -> usize {
        let envelopes = match self.subscription.lock() {
            Ok(slot) => slot.as_ref().map(Subscription::drain).unwrap_or_default(),
            Err(_) => return 0,
        };

        let touched: HashSet<TenantId> = envelopes.iter().map(|e| e.tenant_id()).collect();
        for tenant_id in &touched {
            self.invalidate(*tenant_id);
        }
        if !envelopes.is_empty() {
            debug!(notifications = envelopes.len(), tenants = touched.len(), "stock view invalidated");
        }
        envelopes.len()
    }
}

impl<S> StockView<S>
where
    S: MovementStore,
{
    /// Recompute a tenant's snapshot from the store.
    ///
    /// The snapshot is returned to the caller either way, but it is only
    /// cached if no write invalidated the tenant while it was being loaded.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn refresh(&self, tenant_id: TenantId) -> Result<Arc<StockSnapshot>, MovementStoreError> {
        let generation = self.generation(tenant_id);
        let stored = self.store.load_tenant(tenant_id).await?;
        let head = stored.iter().map(|s| s.position).max().unwrap_or(0);
        let movements: Vec<MovementRecord> = stored.into_iter().map(|s| s.record).collect();
        let projection = project_stock(&movements);

        debug!(
            tenant_id = %tenant_id,
            movements = movements.len(),
            batches = projection.len(),
            head,
            "stock projection refreshed"
        );

        let snapshot = Arc::new(StockSnapshot {
            tenant_id,
            movements,
            projection,
            head,
            refreshed_at: Utc::now(),
        });

        if !self.install(&snapshot, generation) {
            debug!(tenant_id = %tenant_id, head, "tenant invalidated during refresh; snapshot not cached");
        }
        if let Ok(mut known) = self.known.write() {
            known.insert(tenant_id);
        }
        Ok(snapshot)
    }

    /// Cached snapshot, refreshing on miss.
    pub async fn snapshot(&self, tenant_id: TenantId) -> Result<Arc<StockSnapshot>, MovementStoreError> {
        self.drain_notifications();
        match self.cached(tenant_id) {
            Some(snapshot) => Ok(snapshot),
            None => self.refresh(tenant_id).await,
        }
    }

    /// Refresh every known tenant whose store head moved past its snapshot.
    ///
    /// Catches writes that bypassed this process's bus (another instance on
    /// the same database). Returns the number of tenants recomputed.
    pub async fn refresh_known(&self) -> Result<usize, MovementStoreError> {
        self.drain_notifications();
        let tenants: Vec<TenantId> = match self.known.read() {
            Ok(known) => known.iter().copied().collect(),
            Err(_) => return Ok(0),
        };

        let mut refreshed = 0;
        for tenant_id in tenants {
            let head = self.store.head(tenant_id).await?;
            let stale = self.cached(tenant_id).is_none_or(|s| s.head != head);
            if stale {
                self.refresh(tenant_id).await?;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    pub async fn stock(&self, tenant_id: TenantId, query: &StockQuery) -> Result<Vec<BatchStock>, MovementStoreError> {
        Ok(self.snapshot(tenant_id).await?.stock(query))
    }

    pub async fn history(
        &self,
        tenant_id: TenantId,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, MovementStoreError> {
        Ok(self.snapshot(tenant_id).await?.history(filter))
    }

    pub async fn available(&self, tenant_id: TenantId, location_id: &str) -> Result<Vec<BatchStock>, MovementStoreError> {
        Ok(self.snapshot(tenant_id).await?.available(location_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_events::EventBus;
    use stockledger_ledger::MovementCandidate;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use stockledger_core::ExpectedVersion;
    use stockledger_ledger::BatchKey;

    use crate::dispatcher::{LedgerDispatcher, MovementBus};
    use crate::movement_store::{InMemoryMovementStore, LoadedStream, StoredMovement};

    #[tokio::test]
    async fn serves_cached_snapshot_until_notified() {
        let store = Arc::new(InMemoryMovementStore::new());
        let bus = Arc::new(MovementBus::new());
        let view = StockView::new(store.clone());
        view.attach(bus.subscribe());
        let d = LedgerDispatcher::new(store.clone(), bus.clone());
        let tenant = TenantId::new();

        d.record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(100)))
            .await
            .unwrap();
        let first = view.snapshot(tenant).await.unwrap();
        assert_eq!(first.totals().current, dec!(100));

        // Same Arc while nothing changed.
        let again = view.snapshot(tenant).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        d.record_movement(tenant, MovementCandidate::issue("CR-1", "B1", dec!(30)))
            .await
            .unwrap();
        let after = view.snapshot(tenant).await.unwrap();
        assert_eq!(after.totals().current, dec!(70));
        assert_eq!(after.head, 2);
    }

    #[tokio::test]
    async fn refresh_known_picks_up_writes_that_skipped_the_bus() {
        let store = Arc::new(InMemoryMovementStore::new());
        let view = StockView::new(store.clone());
        // Writer publishes on a bus nobody attached to the view.
        let d = LedgerDispatcher::new(store.clone(), MovementBus::new());
        let tenant = TenantId::new();

        d.record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(10)))
            .await
            .unwrap();
        assert_eq!(view.snapshot(tenant).await.unwrap().totals().current, dec!(10));

        d.record_movement(tenant, MovementCandidate::receipt("CR-1", "B2", dec!(5)))
            .await
            .unwrap();
        assert_eq!(view.snapshot(tenant).await.unwrap().projection.len(), 1);

        assert_eq!(view.refresh_known().await.unwrap(), 1);
        assert_eq!(view.snapshot(tenant).await.unwrap().projection.len(), 2);
        assert_eq!(view.refresh_known().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn available_hides_depleted_batches() {
        let store = Arc::new(InMemoryMovementStore::new());
        let view = StockView::new(store.clone());
        let d = LedgerDispatcher::new(store.clone(), MovementBus::new());
        let tenant = TenantId::new();

        for c in [
            MovementCandidate::receipt("CR-1", "B1", dec!(10)),
            MovementCandidate::receipt("CR-1", "B2", dec!(4)),
            MovementCandidate::issue("CR-1", "B2", dec!(4)),
            MovementCandidate::receipt("CR-2", "B3", dec!(1)),
        ] {
            d.record_movement(tenant, c).await.unwrap();
        }

        let rows = view.available(tenant, "CR-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].batch_id, "B1");

        let history = view
            .history(tenant, &MovementFilter { batch_id: Some("B2".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    /// Holds the first `load_tenant` after it has read the log, until released.
    struct PausedLoad {
        inner: Arc<InMemoryMovementStore>,
        gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    #[async_trait]
    impl MovementStore for PausedLoad {
        async fn append(
            &self,
            tenant_id: TenantId,
            key: &BatchKey,
            movements: Vec<MovementRecord>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredMovement>, MovementStoreError> {
            self.inner.append(tenant_id, key, movements, expected_version).await
        }

        async fn load_stream(&self, tenant_id: TenantId, key: &BatchKey) -> Result<LoadedStream, MovementStoreError> {
            self.inner.load_stream(tenant_id, key).await
        }

        async fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredMovement>, MovementStoreError> {
            let rows = self.inner.load_tenant(tenant_id).await?;
            let gate = self.gate.lock().unwrap().take();
            if let Some((loaded, release)) = gate {
                let _ = loaded.send(());
                let _ = release.await;
            }
            Ok(rows)
        }

        async fn head(&self, tenant_id: TenantId) -> Result<u64, MovementStoreError> {
            self.inner.head(tenant_id).await
        }
    }

    #[tokio::test]
    async fn write_during_refresh_is_not_hidden_by_the_older_snapshot() {
        let inner = Arc::new(InMemoryMovementStore::new());
        let (loaded_tx, loaded_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let view = Arc::new(StockView::new(PausedLoad {
            inner: inner.clone(),
            gate: Mutex::new(Some((loaded_tx, release_rx))),
        }));
        let d = LedgerDispatcher::new(inner.clone(), MovementBus::new());
        let tenant = TenantId::new();

        d.record_movement(tenant, MovementCandidate::receipt("CR-1", "B1", dec!(100)))
            .await
            .unwrap();

        let reader = tokio::spawn({
            let view = view.clone();
            async move { view.refresh(tenant).await }
        });
        loaded_rx.await.unwrap();

        // Commit and invalidate while the reader holds the head-1 log.
        d.record_movement(tenant, MovementCandidate::issue("CR-1", "B1", dec!(40)))
            .await
            .unwrap();
        view.invalidate(tenant);
        release_tx.send(()).unwrap();

        let stale = reader.await.unwrap().unwrap();
        assert_eq!(stale.head, 1);
        assert!(view.cached(tenant).is_none());

        let fresh = view.snapshot(tenant).await.unwrap();
        assert_eq!(fresh.totals().current, dec!(60));
        assert_eq!(fresh.head, 2);
    }
}
