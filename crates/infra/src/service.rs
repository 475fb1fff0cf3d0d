//! `StockLedger`: the library surface the API (or any other caller) talks to.
//!
//! Writes go through `LedgerDispatcher`; reads are served from `StockView`.
//! Both share one store, and the view listens on the dispatcher's bus.

use std::sync::Arc;

use stockledger_core::{MovementId, TenantId, UserId};
use stockledger_events::EventBus;
use stockledger_ledger::{
    BatchKey, BatchStock, MovementCandidate, MovementFilter, MovementRecord, StockQuery,
    StockTotals,
};

use crate::dispatcher::{DispatchError, LedgerDispatcher, MovementEnvelope};
use crate::movement_store::MovementStore;
use crate::stock_view::{StockSnapshot, StockView};

pub struct StockLedger<S, B> {
    dispatcher: LedgerDispatcher<S, B>,
    view: StockView<S>,
}

impl<S, B> StockLedger<S, B>
where
    S: MovementStore + Clone,
    B: EventBus<MovementEnvelope>,
{
    pub fn new(store: S, bus: B) -> Self {
        let view = StockView::new(store.clone());
        view.attach(bus.subscribe());
        Self {
            dispatcher: LedgerDispatcher::new(store, bus),
            view,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.dispatcher = self.dispatcher.with_conflict_retries(retries);
        self
    }

    pub fn view(&self) -> &StockView<S> {
        &self.view
    }

    pub fn dispatcher(&self) -> &LedgerDispatcher<S, B> {
        &self.dispatcher
    }

    pub async fn record_movement(
        &self,
        tenant_id: TenantId,
        candidate: MovementCandidate,
    ) -> Result<MovementRecord, DispatchError> {
        let record = self.dispatcher.record_movement(tenant_id, candidate).await?;
        self.view.invalidate(tenant_id);
        Ok(record)
    }

    pub async fn reverse_movement(
        &self,
        tenant_id: TenantId,
        location_id: &str,
        batch_id: &str,
        movement_id: MovementId,
        operator_id: Option<UserId>,
        reason: Option<String>,
    ) -> Result<MovementRecord, DispatchError> {
        let key = BatchKey::new(location_id, batch_id);
        let record = self
            .dispatcher
            .reverse_movement(tenant_id, key, movement_id, operator_id, reason)
            .await?;
        self.view.invalidate(tenant_id);
        Ok(record)
    }

    pub async fn stock(&self, tenant_id: TenantId, query: &StockQuery) -> Result<Vec<BatchStock>, DispatchError> {
        Ok(self.view.stock(tenant_id, query).await?)
    }

    pub async fn history(
        &self,
        tenant_id: TenantId,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, DispatchError> {
        Ok(self.view.history(tenant_id, filter).await?)
    }

    /// Batches the issue form may offer at `location_id`.
    pub async fn available_batches(
        &self,
        tenant_id: TenantId,
        location_id: &str,
    ) -> Result<Vec<BatchStock>, DispatchError> {
        Ok(self.view.available(tenant_id, location_id).await?)
    }

    pub async fn totals(&self, tenant_id: TenantId) -> Result<StockTotals, DispatchError> {
        Ok(self.view.snapshot(tenant_id).await?.totals())
    }

    pub async fn snapshot(&self, tenant_id: TenantId) -> Result<Arc<StockSnapshot>, DispatchError> {
        Ok(self.view.snapshot(tenant_id).await?)
    }

    /// Background hook: recompute stale tenant snapshots.
    pub async fn refresh_known(&self) -> Result<usize, DispatchError> {
        Ok(self.view.refresh_known().await?)
    }
}
