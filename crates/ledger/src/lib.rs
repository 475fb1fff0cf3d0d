//! Cold-room stock ledger (event-sourced).
//!
//! Stock is never stored; it is derived from an append-only log of goods
//! receipts (`In`) and goods issues (`Out`) per batch. This crate holds the
//! deterministic parts: movement types and validation, the per-batch decision
//! aggregate that refuses over-issue, and the projection that folds a log into
//! current stock. No IO, no storage.

pub mod batch;
pub mod error;
pub mod movement;
pub mod projection;
pub mod query;

pub use batch::{BatchLedger, LedgerCommand, LedgerEvent, RecordMovement, ReverseMovement};
pub use error::LedgerError;
pub use movement::{BatchKey, Direction, MovementCandidate, MovementRecord, RawMovement};
pub use projection::{
    BatchStock, StockProjection, StockTotals, decode_raw, filter_depleted, project_raw,
    project_stock,
};
pub use query::{MovementFilter, StockQuery};
