//! Postgres-backed movement store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | MovementStoreError | Scenario |
//! |------------|-----------------|--------------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Racing append took the same sequence number |
//! | Database (check violation) | `23514` | `InvalidAppend` | Non-positive quantity reached the table |
//! | Database (other) | Any other | `Backend` | |
//! | PoolClosed / Io / timeouts | N/A | `Backend` | Connection failures |
//!
//! ## Tolerant reads
//!
//! Descriptive and key columns are nullable so that rows imported from older
//! tooling can live in the same table. A row that cannot be turned into a
//! movement (missing key, direction or quantity) is skipped with a warning and
//! never counted as zero. Skipped rows still count toward the stream version,
//! so a malformed newest row does not wedge appends to its batch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument, warn};

use stockledger_core::{ExpectedVersion, MovementId, TenantId, UserId};
use stockledger_ledger::{BatchKey, MovementRecord, RawMovement};

use super::{LoadedStream, MovementStore, MovementStoreError, StoredMovement, validate_batch};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stock_movements (
        position            BIGSERIAL PRIMARY KEY,
        movement_id         UUID UNIQUE,
        tenant_id           UUID NOT NULL,
        location_id         TEXT,
        batch_id            TEXT,
        sequence_number     BIGINT NOT NULL CHECK (sequence_number > 0),
        production_batch_id TEXT,
        product_type        TEXT,
        product_category    TEXT,
        direction           TEXT,
        quantity            NUMERIC CHECK (quantity > 0),
        unit_weight         TEXT,
        occurred_at         TIMESTAMPTZ,
        operator_id         UUID,
        reference           TEXT,
        reverses            UUID,
        recorded_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (tenant_id, location_id, batch_id, sequence_number)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS stock_movements_tenant_position
        ON stock_movements (tenant_id, position)
    "#,
];

const SELECT_COLUMNS: &str = r#"
    SELECT
        position,
        movement_id,
        location_id,
        batch_id,
        sequence_number,
        production_batch_id,
        product_type,
        product_category,
        direction,
        quantity,
        unit_weight,
        occurred_at,
        operator_id,
        reference,
        reverses
    FROM stock_movements
"#;

/// Postgres-backed append-only movement store.
///
/// Every query filters on `tenant_id`. The append runs in one transaction:
/// read the stream's `MAX(sequence_number)`, compare with the expected
/// version, insert. A writer that commits in between trips the unique
/// constraint on `(tenant_id, location_id, batch_id, sequence_number)` and the
/// loser gets `Concurrency`.
#[derive(Debug, Clone)]
pub struct PostgresMovementStore {
    pool: Arc<PgPool>,
}

impl PostgresMovementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect and make sure the table exists.
    pub async fn connect(database_url: &str) -> Result<Self, MovementStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), MovementStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Run a select over `stock_movements`. Returns the decodable rows and the
    /// highest `sequence_number` seen, skipped rows included.
    async fn fetch(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        tenant_id: TenantId,
    ) -> Result<(Vec<StoredMovement>, u64), MovementStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let mut out = Vec::with_capacity(rows.len());
        let mut max_sequence = 0u64;
        for row in rows {
            let position: i64 = row
                .try_get("position")
                .map_err(|e| map_sqlx_error(operation, e))?;
            let sequence_number: i64 = row
                .try_get("sequence_number")
                .map_err(|e| map_sqlx_error(operation, e))?;
            max_sequence = max_sequence.max(sequence_number as u64);
            match decode_row(&row, tenant_id) {
                Ok(stored) => out.push(stored),
                Err(reason) => warn!(
                    tenant_id = %tenant_id,
                    position,
                    sequence_number,
                    reason = %reason,
                    "skipping malformed movement row"
                ),
            }
        }
        Span::current().record("movement_count", out.len());
        Ok((out, max_sequence))
    }
}

#[async_trait]
impl MovementStore for PostgresMovementStore {
    #[instrument(
        skip(self, movements),
        fields(tenant_id = %tenant_id, stream = %key, movement_count = movements.len(), expected_version = ?expected_version),
        err
    )]
    async fn append(
        &self,
        tenant_id: TenantId,
        key: &BatchKey,
        movements: Vec<MovementRecord>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredMovement>, MovementStoreError> {
        if movements.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(tenant_id, key, &movements)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = stream_version(&mut tx, tenant_id, key).await?;
        if !expected_version.matches(current) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(MovementStoreError::Concurrency(format!(
                "{key}: expected {expected_version:?}, found {current}"
            )));
        }

        let mut committed = Vec::with_capacity(movements.len());
        let mut next_sequence = current + 1;
        for record in movements {
            let row = sqlx::query(
                r#"
                INSERT INTO stock_movements (
                    movement_id, tenant_id, location_id, batch_id, sequence_number,
                    production_batch_id, product_type, product_category, direction,
                    quantity, unit_weight, occurred_at, operator_id, reference, reverses
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                RETURNING position
                "#,
            )
            .bind(record.id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(&record.location_id)
            .bind(&record.batch_id)
            .bind(next_sequence as i64)
            .bind(&record.production_batch_id)
            .bind(&record.product_type)
            .bind(&record.product_category)
            .bind(record.direction.as_str())
            .bind(record.quantity)
            .bind(&record.unit_weight)
            .bind(record.occurred_at)
            .bind(record.operator_id.map(|u| *u.as_uuid()))
            .bind(&record.reference)
            .bind(record.reverses.map(|m| *m.as_uuid()))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    MovementStoreError::Concurrency(format!(
                        "{key}: sequence_number {next_sequence} already taken"
                    ))
                } else {
                    map_sqlx_error("insert_movement", e)
                }
            })?;

            let position: i64 = row
                .try_get("position")
                .map_err(|e| map_sqlx_error("insert_movement", e))?;
            committed.push(StoredMovement {
                record,
                sequence_number: next_sequence,
                position: position as u64,
            });
            next_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(committed)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, stream = %key, movement_count), err)]
    async fn load_stream(&self, tenant_id: TenantId, key: &BatchKey) -> Result<LoadedStream, MovementStoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE tenant_id = $1 AND location_id = $2 AND batch_id = $3 ORDER BY sequence_number ASC"
        );
        let query = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(&key.location_id)
            .bind(&key.batch_id);
        let (movements, version) = self.fetch("load_stream", query, tenant_id).await?;
        Ok(LoadedStream { movements, version })
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, movement_count), err)]
    async fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredMovement>, MovementStoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE tenant_id = $1 ORDER BY position ASC");
        let query = sqlx::query(&sql).bind(tenant_id.as_uuid());
        let (movements, _) = self.fetch("load_tenant", query, tenant_id).await?;
        Ok(movements)
    }

    async fn head(&self, tenant_id: TenantId) -> Result<u64, MovementStoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(position), 0) AS head FROM stock_movements WHERE tenant_id = $1",
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("head", e))?;
        let head: i64 = row.try_get("head").map_err(|e| map_sqlx_error("head", e))?;
        Ok(head as u64)
    }
}

async fn stream_version(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    key: &BatchKey,
) -> Result<u64, MovementStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence_number), 0) AS current_version
        FROM stock_movements
        WHERE tenant_id = $1 AND location_id = $2 AND batch_id = $3
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(&key.location_id)
    .bind(&key.batch_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("stream_version", e))?;
    Ok(current as u64)
}

fn decode_row(row: &PgRow, tenant_id: TenantId) -> Result<StoredMovement, String> {
    let get_err = |e: sqlx::Error| e.to_string();

    let position: i64 = row.try_get("position").map_err(get_err)?;
    let sequence_number: i64 = row.try_get("sequence_number").map_err(get_err)?;
    let movement_id: Option<uuid::Uuid> = row.try_get("movement_id").map_err(get_err)?;
    let operator_id: Option<uuid::Uuid> = row.try_get("operator_id").map_err(get_err)?;
    let reverses: Option<uuid::Uuid> = row.try_get("reverses").map_err(get_err)?;
    let quantity: Option<Decimal> = row.try_get("quantity").map_err(get_err)?;
    let occurred_at: Option<DateTime<Utc>> = row.try_get("occurred_at").map_err(get_err)?;

    let raw = RawMovement {
        id: movement_id.map(MovementId::from_uuid),
        location_id: row.try_get("location_id").map_err(get_err)?,
        batch_id: row.try_get("batch_id").map_err(get_err)?,
        production_batch_id: row.try_get("production_batch_id").map_err(get_err)?,
        product_type: row.try_get("product_type").map_err(get_err)?,
        product_category: row.try_get("product_category").map_err(get_err)?,
        direction: row.try_get("direction").map_err(get_err)?,
        quantity,
        unit_weight: row.try_get("unit_weight").map_err(get_err)?,
        occurred_at,
        operator_id: operator_id.map(UserId::from_uuid),
        reference: row.try_get("reference").map_err(get_err)?,
        reverses: reverses.map(MovementId::from_uuid),
    };

    Ok(StoredMovement {
        record: raw.into_record(tenant_id)?,
        sequence_number: sequence_number as u64,
        position: position as u64,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> MovementStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => MovementStoreError::Concurrency(msg),
                Some("23514") => MovementStoreError::InvalidAppend(msg),
                _ => MovementStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            MovementStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => MovementStoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}
