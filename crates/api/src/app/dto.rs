use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockledger_core::UserId;
use stockledger_ledger::{BatchStock, MovementCandidate, MovementFilter, StockQuery, StockTotals};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /ledger/movements`.
///
/// Key fields default to empty and `quantity` is untyped so that a blank key,
/// a non-numeric quantity or an unknown direction reach the ledger and come
/// back as typed validation errors.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RecordMovementRequest {
    pub location_id: String,
    pub batch_id: String,
    pub direction: String,
    pub quantity: Option<JsonValue>,
    pub production_batch_id: Option<String>,
    pub product_type: Option<String>,
    pub product_category: Option<String>,
    pub unit_weight: Option<String>,
    pub reference: Option<String>,
}

impl RecordMovementRequest {
    pub fn into_candidate(self, operator_id: Option<UserId>) -> MovementCandidate {
        MovementCandidate {
            location_id: self.location_id,
            batch_id: self.batch_id,
            direction: self.direction,
            quantity: self.quantity.as_ref().and_then(parse_quantity),
            production_batch_id: self.production_batch_id,
            product_type: self.product_type,
            product_category: self.product_category,
            unit_weight: self.unit_weight,
            operator_id,
            reference: self.reference,
        }
    }
}

/// Body of `POST /ledger/movements/:id/reverse`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReverseMovementRequest {
    pub location_id: String,
    pub batch_id: String,
    pub reason: Option<String>,
}

/// Query string of `GET /ledger/movements` (and its CSV export).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HistoryParams {
    pub location_id: Option<String>,
    pub batch_id: Option<String>,
    pub category: Option<String>,
    pub product_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub search: Option<String>,
}

impl HistoryParams {
    pub fn into_filter(self) -> MovementFilter {
        MovementFilter {
            location_id: blank_to_none(self.location_id),
            batch_id: blank_to_none(self.batch_id),
            product_category: blank_to_none(self.category),
            product_type: blank_to_none(self.product_type),
            occurred_from: self.from,
            occurred_to: self.to,
            search: blank_to_none(self.search),
        }
    }
}

/// Query string of `GET /ledger/stock` (and its CSV export).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StockParams {
    pub location_id: Option<String>,
    pub category: Option<String>,
    pub product_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub include_depleted: bool,
}

impl StockParams {
    pub fn into_query(self) -> StockQuery {
        StockQuery {
            movements: MovementFilter {
                location_id: blank_to_none(self.location_id),
                product_category: blank_to_none(self.category),
                product_type: blank_to_none(self.product_type),
                occurred_from: self.from,
                occurred_to: self.to,
                ..MovementFilter::default()
            },
            search: blank_to_none(self.search),
            include_depleted: self.include_depleted,
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub totals: StockTotals,
    pub rows: Vec<BatchStock>,
}

impl From<Vec<BatchStock>> for StockResponse {
    fn from(rows: Vec<BatchStock>) -> Self {
        Self {
            totals: StockTotals::of(&rows),
            rows,
        }
    }
}

/// Number or numeric string; anything else is "not a number".
pub fn parse_quantity(value: &JsonValue) -> Option<Decimal> {
    let text = match value {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => return None,
    };
    text.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(&text).ok())
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
