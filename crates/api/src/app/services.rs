use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use stockledger_core::{MovementId, TenantId, UserId};
use stockledger_infra::{
    DispatchError, InMemoryMovementStore, MovementBus, MovementStoreError, PostgresMovementStore,
    StockLedger,
};
use stockledger_ledger::{BatchStock, MovementCandidate, MovementFilter, MovementRecord, StockQuery};

use crate::config::ApiConfig;

type InMemoryLedger = StockLedger<Arc<InMemoryMovementStore>, Arc<MovementBus>>;
type PersistentLedger = StockLedger<Arc<PostgresMovementStore>, Arc<MovementBus>>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")]
    MissingDatabaseUrl,

    #[error("failed to open movement store: {0}")]
    Store(#[from] MovementStoreError),
}

/// Store-specific wiring behind one set of ledger operations.
#[derive(Clone)]
pub enum AppServices {
    InMemory { ledger: Arc<InMemoryLedger> },
    Persistent { ledger: Arc<PersistentLedger> },
}

pub async fn build_services(config: &ApiConfig) -> Result<AppServices, ServiceError> {
    if config.use_persistent_stores {
        let url = config.database_url.as_deref().ok_or(ServiceError::MissingDatabaseUrl)?;
        let store = Arc::new(PostgresMovementStore::connect(url).await?);
        tracing::info!("using postgres movement store");
        let ledger = StockLedger::new(store, Arc::new(MovementBus::new()))
            .with_conflict_retries(config.conflict_retries);
        return Ok(AppServices::Persistent { ledger: Arc::new(ledger) });
    }

    Ok(build_in_memory_services(config.conflict_retries))
}

pub fn build_in_memory_services(conflict_retries: u32) -> AppServices {
    let store = Arc::new(InMemoryMovementStore::new());
    let ledger = StockLedger::new(store, Arc::new(MovementBus::new())).with_conflict_retries(conflict_retries);
    AppServices::InMemory { ledger: Arc::new(ledger) }
}

impl AppServices {
    pub async fn record_movement(
        &self,
        tenant_id: TenantId,
        candidate: MovementCandidate,
    ) -> Result<MovementRecord, DispatchError> {
        match self {
            AppServices::InMemory { ledger } => ledger.record_movement(tenant_id, candidate).await,
            AppServices::Persistent { ledger } => ledger.record_movement(tenant_id, candidate).await,
        }
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
        match self {
            AppServices::InMemory { ledger } => {
                ledger
                    .reverse_movement(tenant_id, location_id, batch_id, movement_id, operator_id, reason)
                    .await
            }
            AppServices::Persistent { ledger } => {
                ledger
                    .reverse_movement(tenant_id, location_id, batch_id, movement_id, operator_id, reason)
                    .await
            }
        }
    }

    pub async fn stock(&self, tenant_id: TenantId, query: &StockQuery) -> Result<Vec<BatchStock>, DispatchError> {
        match self {
            AppServices::InMemory { ledger } => ledger.stock(tenant_id, query).await,
            AppServices::Persistent { ledger } => ledger.stock(tenant_id, query).await,
        }
    }

    pub async fn history(
        &self,
        tenant_id: TenantId,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, DispatchError> {
        match self {
            AppServices::InMemory { ledger } => ledger.history(tenant_id, filter).await,
            AppServices::Persistent { ledger } => ledger.history(tenant_id, filter).await,
        }
    }

    pub async fn available_batches(
        &self,
        tenant_id: TenantId,
        location_id: &str,
    ) -> Result<Vec<BatchStock>, DispatchError> {
        match self {
            AppServices::InMemory { ledger } => ledger.available_batches(tenant_id, location_id).await,
            AppServices::Persistent { ledger } => ledger.available_batches(tenant_id, location_id).await,
        }
    }

    pub async fn refresh_known(&self) -> Result<usize, DispatchError> {
        match self {
            AppServices::InMemory { ledger } => ledger.refresh_known().await,
            AppServices::Persistent { ledger } => ledger.refresh_known().await,
        }
    }
}

/// Periodically recompute stale stock snapshots.
pub fn spawn_refresh_task(services: Arc<AppServices>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; nothing is cached yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match services.refresh_known().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(tenants = n, "refreshed stock snapshots"),
                Err(e) => tracing::warn!(error = %e, "stock refresh failed"),
            }
        }
    })
}
