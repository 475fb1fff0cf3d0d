//! Ledger rejections.

use rust_decimal::Decimal;
use thiserror::Error;

use stockledger_core::MovementId;

use crate::movement::BatchKey;

/// Why the ledger refused a movement.
///
/// Every variant is raised before anything is written. `Validation`,
/// `InvalidQuantity` and `UnknownDirection` are caller-input problems; the rest
/// are business-rule rejections and carry enough detail to tell the operator
/// what to do ("requested 70, only 60 available").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("unknown movement direction '{0}' (expected In or Out)")]
    UnknownDirection(String),

    #[error("batch {0} has never been received")]
    BatchNotFound(BatchKey),

    #[error(
        "cannot issue more than available for batch {key}: requested {requested}, only {available} available"
    )]
    InsufficientStock {
        key: BatchKey,
        requested: Decimal,
        available: Decimal,
    },

    #[error("movement {movement_id} not found in batch {key}")]
    MovementNotFound { key: BatchKey, movement_id: MovementId },

    #[error("movement {0} has already been reversed")]
    AlreadyReversed(MovementId),

    #[error("tenant mismatch")]
    TenantMismatch,
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Caller-input errors (fix the form and resubmit).
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::InvalidQuantity(_) | Self::UnknownDirection(_)
        )
    }

    /// How much stock is missing for a rejected issue, if that is the reason.
    pub fn shortfall(&self) -> Option<Decimal> {
        match self {
            Self::InsufficientStock {
                requested,
                available,
                ..
            } => Some(*requested - *available),
            _ => None,
        }
    }
}
