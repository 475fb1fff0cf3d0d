//! Movement records: the append-only facts the ledger is built from.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{MovementId, TenantId, UserId};

use crate::error::LedgerError;

/// Direction of a movement: goods receipt (`In`) or goods issue (`Out`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "In",
            Direction::Out => "Out",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }

    /// Parse a user-supplied direction (`in`/`out`, any case, surrounding
    /// whitespace ignored).
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            _ => Err(LedgerError::UnknownDirection(raw.to_string())),
        }
    }
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Direction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::parse(s)
    }
}

/// Ledger key: a batch inside one location (cold room / facility).
///
/// Two locations may mint the same batch identifier; they are different
/// batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub location_id: String,
    pub batch_id: String,
}

impl BatchKey {
    pub fn new(location_id: impl Into<String>, batch_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into().trim().to_string(),
            batch_id: batch_id.into().trim().to_string(),
        }
    }

    /// Stream name used by stores and envelopes.
    pub fn stream_name(&self) -> String {
        format!("{}/{}", self.location_id, self.batch_id)
    }

    fn ensure_complete(&self) -> Result<(), LedgerError> {
        if self.location_id.is_empty() {
            return Err(LedgerError::validation("location_id cannot be empty"));
        }
        if self.batch_id.is_empty() {
            return Err(LedgerError::validation("batch_id cannot be empty"));
        }
        Ok(())
    }
}

impl core::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.location_id, self.batch_id)
    }
}

/// A movement as submitted by a receipt or issue form, before validation.
///
/// `direction` is raw text and `quantity` is optional so that "not a number"
/// and "not In/Out" reach the ledger and are rejected with a typed error
/// instead of failing somewhere in deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementCandidate {
    pub location_id: String,
    pub batch_id: String,
    pub direction: String,
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub production_batch_id: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub product_category: Option<String>,
    #[serde(default)]
    pub unit_weight: Option<String>,
    #[serde(default)]
    pub operator_id: Option<UserId>,
    #[serde(default)]
    pub reference: Option<String>,
}

impl MovementCandidate {
    /// Goods receipt into `location_id`.
    pub fn receipt(
        location_id: impl Into<String>,
        batch_id: impl Into<String>,
        quantity: Decimal,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            batch_id: batch_id.into(),
            direction: Direction::In.as_str().to_string(),
            quantity: Some(quantity),
            ..Self::default()
        }
    }

    /// Goods issue out of `location_id`.
    pub fn issue(
        location_id: impl Into<String>,
        batch_id: impl Into<String>,
        quantity: Decimal,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            batch_id: batch_id.into(),
            direction: Direction::Out.as_str().to_string(),
            quantity: Some(quantity),
            ..Self::default()
        }
    }

    pub fn with_product(
        mut self,
        product_type: impl Into<String>,
        product_category: impl Into<String>,
    ) -> Self {
        self.product_type = Some(product_type.into());
        self.product_category = Some(product_category.into());
        self
    }

    pub fn with_production_batch(mut self, production_batch_id: impl Into<String>) -> Self {
        self.production_batch_id = Some(production_batch_id.into());
        self
    }

    pub fn with_operator(mut self, operator_id: UserId) -> Self {
        self.operator_id = Some(operator_id);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.location_id.as_str(), self.batch_id.as_str())
    }

    /// Input validation that does not need ledger state.
    ///
    /// Order: key completeness, then quantity, then direction.
    pub fn validate(&self) -> Result<(BatchKey, Direction, Decimal), LedgerError> {
        let key = self.key();
        key.ensure_complete()?;

        let quantity = match self.quantity {
            None => return Err(LedgerError::InvalidQuantity("quantity is missing or not a number".into())),
            Some(q) if q <= Decimal::ZERO => {
                return Err(LedgerError::InvalidQuantity(format!("quantity must be positive (got {q})")));
            }
            Some(q) => q,
        };

        let direction = Direction::parse(&self.direction)?;
        Ok((key, direction, quantity))
    }
}

/// An accepted, immutable movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub id: MovementId,
    pub tenant_id: TenantId,
    pub location_id: String,
    pub batch_id: String,
    pub production_batch_id: Option<String>,
    pub product_type: Option<String>,
    pub product_category: Option<String>,
    pub direction: Direction,
    pub quantity: Decimal,
    pub unit_weight: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub operator_id: Option<UserId>,
    pub reference: Option<String>,
    /// Set on compensating entries: the movement this one cancels.
    pub reverses: Option<MovementId>,
}

impl MovementRecord {
    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.location_id.as_str(), self.batch_id.as_str())
    }

    /// `+quantity` for receipts, `-quantity` for issues.
    pub fn signed_quantity(&self) -> Decimal {
        match self.direction {
            Direction::In => self.quantity,
            Direction::Out => -self.quantity,
        }
    }
}

/// A movement row as read back from a store that does not enforce the schema
/// (legacy tables, imported files). Every field is optional; see
/// [`RawMovement::into_record`] for which gaps are tolerated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMovement {
    pub id: Option<MovementId>,
    pub location_id: Option<String>,
    pub batch_id: Option<String>,
    pub production_batch_id: Option<String>,
    pub product_type: Option<String>,
    pub product_category: Option<String>,
    pub direction: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_weight: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub operator_id: Option<UserId>,
    pub reference: Option<String>,
    pub reverses: Option<MovementId>,
}

impl RawMovement {
    /// Convert into a record, or explain why the row cannot contribute stock.
    ///
    /// Missing descriptive fields are fine. A missing id, key, direction or
    /// quantity (or a non-positive quantity) is not: such a row is dropped by
    /// the caller rather than counted as zero. A missing timestamp becomes the
    /// Unix epoch so the row can never win "latest movement".
    pub fn into_record(self, tenant_id: TenantId) -> Result<MovementRecord, String> {
        let id = self.id.ok_or("missing id")?;
        let location_id = non_blank(self.location_id).ok_or("missing location_id")?;
        let batch_id = non_blank(self.batch_id).ok_or("missing batch_id")?;
        let quantity = self.quantity.ok_or("missing quantity")?;
        if quantity <= Decimal::ZERO {
            return Err(format!("non-positive quantity {quantity}"));
        }
        let direction = self.direction.as_deref().ok_or("missing direction")?;
        let direction = Direction::parse(direction).map_err(|e| e.to_string())?;

        Ok(MovementRecord {
            id,
            tenant_id,
            location_id,
            batch_id,
            production_batch_id: self.production_batch_id,
            product_type: self.product_type,
            product_category: self.product_category,
            direction,
            quantity,
            unit_weight: self.unit_weight,
            occurred_at: self.occurred_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            operator_id: self.operator_id,
            reference: self.reference,
            reverses: self.reverses,
        })
    }
}

impl From<MovementRecord> for RawMovement {
    fn from(r: MovementRecord) -> Self {
        Self {
            id: Some(r.id),
            location_id: Some(r.location_id),
            batch_id: Some(r.batch_id),
            production_batch_id: r.production_batch_id,
            product_type: r.product_type,
            product_category: r.product_category,
            direction: Some(r.direction.as_str().to_string()),
            quantity: Some(r.quantity),
            unit_weight: r.unit_weight,
            occurred_at: Some(r.occurred_at),
            operator_id: r.operator_id,
            reference: r.reference,
            reverses: r.reverses,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
