//! Delimited-text export of the stock list and movement history.

use chrono::SecondsFormat;
use serde::Serialize;
use thiserror::Error;

use stockledger_ledger::{BatchStock, MovementRecord};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("csv buffer flush failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("export is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Serialize)]
struct StockRow<'a> {
    location_id: &'a str,
    batch_id: &'a str,
    production_batch_id: &'a str,
    product_type: &'a str,
    product_category: &'a str,
    unit_weight: &'a str,
    received: String,
    issued: String,
    current: String,
    movement_count: u64,
    last_updated: String,
}

#[derive(Serialize)]
struct MovementRow<'a> {
    movement_id: String,
    occurred_at: String,
    location_id: &'a str,
    batch_id: &'a str,
    direction: &'static str,
    quantity: String,
    production_batch_id: &'a str,
    product_type: &'a str,
    product_category: &'a str,
    unit_weight: &'a str,
    operator_id: String,
    reference: &'a str,
    reverses: String,
}

/// Write the stock list. Header row first; missing fields are empty cells.
pub fn projection_csv<'a, W: std::io::Write>(
    out: W,
    rows: impl IntoIterator<Item = &'a BatchStock>,
) -> Result<(), ExportError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    // Written explicitly so an empty export still carries the header.
    writer.write_record([
        "location_id",
        "batch_id",
        "production_batch_id",
        "product_type",
        "product_category",
        "unit_weight",
        "received",
        "issued",
        "current",
        "movement_count",
        "last_updated",
    ])?;
    for row in rows {
        writer.serialize(StockRow {
            location_id: &row.location_id,
            batch_id: &row.batch_id,
            production_batch_id: or_empty(&row.production_batch_id),
            product_type: or_empty(&row.product_type),
            product_category: or_empty(&row.product_category),
            unit_weight: or_empty(&row.unit_weight),
            received: row.received.normalize().to_string(),
            issued: row.issued.normalize().to_string(),
            current: row.current.normalize().to_string(),
            movement_count: row.movement_count,
            last_updated: row.last_updated.to_rfc3339_opts(SecondsFormat::Secs, true),
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the movement history in the order given.
pub fn movements_csv<'a, W: std::io::Write>(
    out: W,
    movements: impl IntoIterator<Item = &'a MovementRecord>,
) -> Result<(), ExportError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record([
        "movement_id",
        "occurred_at",
        "location_id",
        "batch_id",
        "direction",
        "quantity",
        "production_batch_id",
        "product_type",
        "product_category",
        "unit_weight",
        "operator_id",
        "reference",
        "reverses",
    ])?;
    for m in movements {
        writer.serialize(MovementRow {
            movement_id: m.id.to_string(),
            occurred_at: m.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            location_id: &m.location_id,
            batch_id: &m.batch_id,
            direction: m.direction.as_str(),
            quantity: m.quantity.normalize().to_string(),
            production_batch_id: or_empty(&m.production_batch_id),
            product_type: or_empty(&m.product_type),
            product_category: or_empty(&m.product_category),
            unit_weight: or_empty(&m.unit_weight),
            operator_id: m.operator_id.map(|u| u.to_string()).unwrap_or_default(),
            reference: or_empty(&m.reference),
            reverses: m.reverses.map(|r| r.to_string()).unwrap_or_default(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn projection_csv_string<'a>(rows: impl IntoIterator<Item = &'a BatchStock>) -> Result<String, ExportError> {
    let mut buf = Vec::new();
    projection_csv(&mut buf, rows)?;
    Ok(String::from_utf8(buf)?)
}

pub fn movements_csv_string<'a>(
    movements: impl IntoIterator<Item = &'a MovementRecord>,
) -> Result<String, ExportError> {
    let mut buf = Vec::new();
    movements_csv(&mut buf, movements)?;
    Ok(String::from_utf8(buf)?)
}

fn or_empty(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}
