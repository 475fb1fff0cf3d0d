//! Stock projection: fold a movement log into current stock per batch.
//!
//! The projection is a pure function of the movements passed in. Totals are
//! sums, so the order of the input does not matter for them; descriptive
//! fields and `last_updated` follow `occurred_at` (ties go to the larger
//! movement id), so they do not depend on input order either. Only the order
//! of rows in the output follows the input: first appearance of each batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{MovementId, TenantId};

use crate::movement::{BatchKey, Direction, MovementRecord, RawMovement};

/// Current stock of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStock {
    pub location_id: String,
    pub batch_id: String,
    pub production_batch_id: Option<String>,
    pub product_type: Option<String>,
    pub product_category: Option<String>,
    pub unit_weight: Option<String>,
    pub received: Decimal,
    pub issued: Decimal,
    pub current: Decimal,
    pub movement_count: u64,
    pub last_updated: DateTime<Utc>,
    /// Movement the descriptive fields were taken from.
    pub last_movement_id: MovementId,
}

impl BatchStock {
    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.location_id.as_str(), self.batch_id.as_str())
    }

    pub fn is_depleted(&self) -> bool {
        self.current <= Decimal::ZERO
    }

    fn start(m: &MovementRecord) -> Self {
        Self {
            location_id: m.location_id.clone(),
            batch_id: m.batch_id.clone(),
            production_batch_id: m.production_batch_id.clone(),
            product_type: m.product_type.clone(),
            product_category: m.product_category.clone(),
            unit_weight: m.unit_weight.clone(),
            received: Decimal::ZERO,
            issued: Decimal::ZERO,
            current: Decimal::ZERO,
            movement_count: 0,
            last_updated: m.occurred_at,
            last_movement_id: m.id,
        }
    }

    /// Add one movement; `false` when the sum would not be representable.
    fn accumulate(&mut self, m: &MovementRecord) -> bool {
        let total = match m.direction {
            Direction::In => &mut self.received,
            Direction::Out => &mut self.issued,
        };
        let Some(sum) = total.checked_add(m.quantity) else {
            return false;
        };
        *total = sum;
        self.movement_count += 1;

        if (m.occurred_at, m.id) >= (self.last_updated, self.last_movement_id) {
            self.last_updated = m.occurred_at;
            self.last_movement_id = m.id;
            self.production_batch_id = m.production_batch_id.clone();
            self.product_type = m.product_type.clone();
            self.product_category = m.product_category.clone();
            self.unit_weight = m.unit_weight.clone();
        }
        true
    }
}

/// Aggregate figures for a summary header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTotals {
    pub received: Decimal,
    pub issued: Decimal,
    pub current: Decimal,
    pub batches_in_stock: usize,
    pub batches_depleted: usize,
}

impl StockTotals {
    pub fn of<'a>(rows: impl IntoIterator<Item = &'a BatchStock>) -> Self {
        rows.into_iter().fold(Self::default(), |mut t, row| {
            t.received = t.received.saturating_add(row.received);
            t.issued = t.issued.saturating_add(row.issued);
            t.current = t.current.saturating_add(row.current);
            if row.is_depleted() {
                t.batches_depleted += 1;
            } else {
                t.batches_in_stock += 1;
            }
            t
        })
    }
}

/// Ordered mapping `BatchKey -> BatchStock`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockProjection {
    rows: Vec<BatchStock>,
    index: HashMap<BatchKey, usize>,
}

impl StockProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BatchKey) -> Option<&BatchStock> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    /// Current stock for a key, zero when the batch never appeared.
    pub fn current(&self, key: &BatchKey) -> Decimal {
        self.get(key).map(|b| b.current).unwrap_or(Decimal::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchStock> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_vec(self) -> Vec<BatchStock> {
        self.rows
    }

    /// Keep rows matching `keep`, preserving order.
    pub fn retain(&mut self, mut keep: impl FnMut(&BatchStock) -> bool) {
        self.rows.retain(|row| keep(row));
        self.reindex();
    }

    pub fn totals(&self) -> StockTotals {
        StockTotals::of(&self.rows)
    }

    fn ingest(&mut self, m: &MovementRecord) {
        let key = m.key();
        let idx = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                self.rows.push(BatchStock::start(m));
                self.index.insert(key, self.rows.len() - 1);
                self.rows.len() - 1
            }
        };
        if !self.rows[idx].accumulate(m) {
            tracing::warn!(
                movement_id = %m.id,
                stream = %m.key(),
                quantity = %m.quantity,
                "skipping movement that overflows batch totals"
            );
        }
    }

    fn finish(mut self) -> Self {
        for row in &mut self.rows {
            row.current = row.received.saturating_sub(row.issued);
        }
        self
    }

    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.key(), i))
            .collect();
    }
}

impl IntoIterator for StockProjection {
    type Item = BatchStock;
    type IntoIter = std::vec::IntoIter<BatchStock>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Fold movements into per-batch stock.
///
/// Records with a blank key or a non-positive quantity cannot be placed or
/// summed; they are skipped with a warning.
pub fn project_stock<'a, I>(movements: I) -> StockProjection
where
    I: IntoIterator<Item = &'a MovementRecord>,
{
    let mut projection = StockProjection::new();
    for m in movements {
        if m.batch_id.trim().is_empty() || m.location_id.trim().is_empty() {
            tracing::warn!(movement_id = %m.id, "skipping movement without batch/location");
            continue;
        }
        if m.quantity <= Decimal::ZERO {
            tracing::warn!(movement_id = %m.id, quantity = %m.quantity, "skipping movement with non-positive quantity");
            continue;
        }
        projection.ingest(m);
    }
    projection.finish()
}

/// Decode raw rows, dropping (and logging) those that cannot contribute stock.
pub fn decode_raw(
    tenant_id: TenantId,
    rows: impl IntoIterator<Item = RawMovement>,
) -> Vec<MovementRecord> {
    rows.into_iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let id = row.id;
            match row.into_record(tenant_id) {
                Ok(r) => Some(r),
                Err(reason) => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        row = i,
                        movement_id = ?id,
                        %reason,
                        "excluding malformed movement from projection"
                    );
                    None
                }
            }
        })
        .collect()
}

/// `decode_raw` followed by `project_stock`.
pub fn project_raw(
    tenant_id: TenantId,
    rows: impl IntoIterator<Item = RawMovement>,
) -> StockProjection {
    let records = decode_raw(tenant_id, rows);
    project_stock(&records)
}

/// Only batches that still have stock.
pub fn filter_depleted(mut projection: StockProjection) -> StockProjection {
    projection.retain(|row| row.current > Decimal::ZERO);
    projection
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn t(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 6, min, 0).unwrap()
    }

    fn mv(tenant: TenantId, batch: &str, direction: Direction, qty: Decimal, at: DateTime<Utc>) -> MovementRecord {
        MovementRecord {
            id: MovementId::new(),
            tenant_id: tenant,
            location_id: "CR-1".into(),
            batch_id: batch.into(),
            production_batch_id: None,
            product_type: None,
            product_category: None,
            direction,
            quantity: qty,
            unit_weight: None,
            occurred_at: at,
            operator_id: None,
            reference: None,
            reverses: None,
        }
    }

    #[test]
    fn scenarios_a_through_d() {
        let tenant = TenantId::new();
        let key = BatchKey::new("CR-1", "B1");
        let mut log = vec![mv(tenant, "B1", Direction::In, dec!(100), t(0))];

        let p = project_stock(&log);
        let b1 = p.get(&key).unwrap();
        assert_eq!((b1.received, b1.issued, b1.current), (dec!(100), dec!(0), dec!(100)));

        log.push(mv(tenant, "B1", Direction::Out, dec!(40), t(1)));
        let p = project_stock(&log);
        let b1 = p.get(&key).unwrap();
        assert_eq!((b1.received, b1.issued, b1.current), (dec!(100), dec!(40), dec!(60)));

        log.push(mv(tenant, "B1", Direction::Out, dec!(60), t(2)));
        let p = project_stock(&log);
        let b1 = p.get(&key).unwrap();
        assert_eq!((b1.received, b1.issued, b1.current), (dec!(100), dec!(100), dec!(0)));
        assert_eq!(b1.movement_count, 3);
        assert_eq!(b1.last_updated, t(2));
        assert!(filter_depleted(p).is_empty());
    }

    #[test]
    fn batches_are_independent_and_keep_first_appearance_order() {
        let tenant = TenantId::new();
        let log = vec![
            mv(tenant, "B2", Direction::In, dec!(5), t(0)),
            mv(tenant, "B1", Direction::In, dec!(10), t(1)),
            mv(tenant, "B2", Direction::Out, dec!(5), t(2)),
        ];
        let p = project_stock(&log);
        let order: Vec<_> = p.iter().map(|b| b.batch_id.as_str()).collect();
        assert_eq!(order, vec!["B2", "B1"]);
        assert_eq!(p.current(&BatchKey::new("CR-1", "B1")), dec!(10));
        assert_eq!(p.current(&BatchKey::new("CR-1", "B2")), dec!(0));

        let remaining = filter_depleted(p);
        assert_eq!(remaining.len(), 1);
        assert!(remaining.get(&BatchKey::new("CR-1", "B1")).is_some());
    }

    #[test]
    fn movement_overflowing_the_batch_is_excluded() {
        let tenant = TenantId::new();
        let log = vec![
            mv(tenant, "B1", Direction::In, Decimal::MAX, t(0)),
            mv(tenant, "B1", Direction::In, Decimal::MAX, t(1)),
            mv(tenant, "B2", Direction::In, Decimal::MAX, t(2)),
        ];

        let p = project_stock(&log);
        let b1 = p.get(&BatchKey::new("CR-1", "B1")).unwrap();
        assert_eq!((b1.received, b1.current, b1.movement_count), (Decimal::MAX, Decimal::MAX, 1));
        assert_eq!(b1.last_updated, t(0));
        assert_eq!(p.totals().current, Decimal::MAX);
    }

    #[test]
    fn same_batch_id_in_two_locations_is_two_batches() {
        let tenant = TenantId::new();
        let mut other = mv(tenant, "B1", Direction::In, dec!(3), t(1));
        other.location_id = "CR-2".into();
        let log = vec![mv(tenant, "B1", Direction::In, dec!(7), t(0)), other];

        let p = project_stock(&log);
        assert_eq!(p.len(), 2);
        assert_eq!(p.current(&BatchKey::new("CR-2", "B1")), dec!(3));
    }

    #[test]
    fn descriptive_fields_follow_latest_occurred_at_not_input_order() {
        let tenant = TenantId::new();
        let mut newer = mv(tenant, "B1", Direction::Out, dec!(1), t(9));
        newer.product_type = Some("arabica".into());
        let mut older = mv(tenant, "B1", Direction::In, dec!(5), t(0));
        older.product_type = Some("robusta".into());

        let p = project_stock([&newer, &older]);
        let row = p.get(&BatchKey::new("CR-1", "B1")).unwrap();
        assert_eq!(row.product_type.as_deref(), Some("arabica"));
        assert_eq!(row.last_updated, t(9));
        assert_eq!(row.last_movement_id, newer.id);
    }

    #[test]
    fn malformed_raw_rows_are_excluded_not_zeroed() {
        let tenant = TenantId::new();
        let good = RawMovement::from(mv(tenant, "B1", Direction::In, dec!(8), t(0)));
        let missing_qty = RawMovement { quantity: None, ..RawMovement::from(mv(tenant, "B1", Direction::In, dec!(8), t(1))) };
        let missing_batch = RawMovement { batch_id: None, ..RawMovement::from(mv(tenant, "B9", Direction::In, dec!(2), t(2))) };
        let no_descriptors = RawMovement {
            product_type: None,
            product_category: None,
            ..RawMovement::from(mv(tenant, "B1", Direction::Out, dec!(3), t(3)))
        };

        let p = project_raw(tenant, vec![good, missing_qty, missing_batch, no_descriptors]);
        assert_eq!(p.len(), 1);
        let row = p.get(&BatchKey::new("CR-1", "B1")).unwrap();
        assert_eq!(row.received, dec!(8));
        assert_eq!(row.movement_count, 2);
        assert_eq!(row.current, dec!(5));
    }

    #[test]
    fn totals_sum_rows_and_count_depleted() {
        let tenant = TenantId::new();
        let log = vec![
            mv(tenant, "B1", Direction::In, dec!(10), t(0)),
            mv(tenant, "B2", Direction::In, dec!(4), t(1)),
            mv(tenant, "B2", Direction::Out, dec!(4), t(2)),
        ];
        let totals = project_stock(&log).totals();
        assert_eq!(totals.received, dec!(14));
        assert_eq!(totals.issued, dec!(4));
        assert_eq!(totals.current, dec!(10));
        assert_eq!((totals.batches_in_stock, totals.batches_depleted), (1, 1));
    }

    fn arb_log() -> impl Strategy<Value = Vec<(u8, bool, u32, u32)>> {
        // (batch index, is_in, quantity, minute)
        prop::collection::vec((0u8..4, any::<bool>(), 1u32..1_000, 0u32..60), 0..60)
    }

    fn build(tenant: TenantId, plan: &[(u8, bool, u32, u32)]) -> Vec<MovementRecord> {
        plan.iter()
            .map(|&(b, is_in, q, m)| {
                let dir = if is_in { Direction::In } else { Direction::Out };
                mv(tenant, &format!("B{b}"), dir, Decimal::from(q), t(m))
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        #[test]
        fn conservation_holds_for_every_row(plan in arb_log()) {
            let log = build(TenantId::new(), &plan);
            for row in project_stock(&log).iter() {
                prop_assert_eq!(row.current, row.received - row.issued);
            }
        }

        #[test]
        fn totals_do_not_depend_on_input_order(plan in arb_log(), seed in any::<u64>()) {
            let log = build(TenantId::new(), &plan);
            let mut shuffled = log.clone();
            // Deterministic permutation from the seed.
            let n = shuffled.len();
            if n > 1 {
                let mut s = seed;
                for i in (1..n).rev() {
                    s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    shuffled.swap(i, (s % (i as u64 + 1)) as usize);
                }
            }

            let a = project_stock(&log);
            let b = project_stock(&shuffled);
            prop_assert_eq!(a.len(), b.len());
            for row in a.iter() {
                let other = b.get(&row.key()).unwrap();
                prop_assert_eq!(row.received, other.received);
                prop_assert_eq!(row.issued, other.issued);
                prop_assert_eq!(row.current, other.current);
                prop_assert_eq!(row.last_updated, other.last_updated);
                prop_assert_eq!(row.last_movement_id, other.last_movement_id);
            }
        }

        #[test]
        fn projecting_twice_is_identical(plan in arb_log()) {
            let log = build(TenantId::new(), &plan);
            prop_assert_eq!(project_stock(&log), project_stock(&log));
        }
    }
}
