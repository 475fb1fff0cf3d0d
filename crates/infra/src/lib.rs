//! Infrastructure layer: movement stores, the serialized write pipeline, the
//! cached stock view, and export.

pub mod dispatcher;
pub mod export;
pub mod movement_store;
pub mod service;
pub mod stock_view;

pub use dispatcher::{DispatchError, LedgerDispatcher, MovementBus, MovementEnvelope};
pub use export::ExportError;
pub use movement_store::{
    InMemoryMovementStore, LoadedStream, MovementStore, MovementStoreError, PostgresMovementStore,
    StoredMovement,
};
pub use service::StockLedger;
pub use stock_view::{StockSnapshot, StockView};
