//! Narrowing for the inventory-summary and movement-history views.
//!
//! Filtering is a pure narrowing of the input; it is not part of the ledger's
//! correctness contract. A date range applied to movements yields the stock
//! moved within that window, not stock on hand at its end.
//!
//! Category and product type pick batches, not movements: issues are usually
//! recorded without tags, so a batch is selected when any of its movements
//! carries the tag, and then all of its movements are projected.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::movement::{BatchKey, MovementRecord};
use crate::projection::{BatchStock, StockProjection, filter_depleted, project_stock};

/// Predicate over individual movements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementFilter {
    pub location_id: Option<String>,
    pub batch_id: Option<String>,
    pub product_category: Option<String>,
    pub product_type: Option<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub occurred_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `occurred_at`.
    pub occurred_to: Option<DateTime<Utc>>,
    /// Case-insensitive substring over batch ids, product fields and reference.
    pub search: Option<String>,
}

impl MovementFilter {
    pub fn for_location(location_id: impl Into<String>) -> Self {
        Self {
            location_id: Some(location_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, m: &MovementRecord) -> bool {
        if !eq_opt(&self.location_id, &m.location_id) || !eq_opt(&self.batch_id, &m.batch_id) {
            return false;
        }
        if !eq_opt_field(&self.product_category, m.product_category.as_deref())
            || !eq_opt_field(&self.product_type, m.product_type.as_deref())
        {
            return false;
        }
        if self.occurred_from.is_some_and(|from| m.occurred_at < from) {
            return false;
        }
        if self.occurred_to.is_some_and(|to| m.occurred_at > to) {
            return false;
        }
        match needle(&self.search) {
            None => true,
            Some(n) => [
                Some(m.batch_id.as_str()),
                m.production_batch_id.as_deref(),
                m.product_type.as_deref(),
                m.product_category.as_deref(),
                m.reference.as_deref(),
            ]
            .into_iter()
            .flatten()
            .any(|h| h.to_lowercase().contains(&n)),
        }
    }

    pub fn apply<'a>(&self, movements: impl IntoIterator<Item = &'a MovementRecord>) -> Vec<&'a MovementRecord> {
        movements.into_iter().filter(|m| self.matches(m)).collect()
    }

    fn has_tag_filter(&self) -> bool {
        self.product_category.is_some() || self.product_type.is_some()
    }

    /// The same filter with category and product type removed.
    fn without_tags(&self) -> Self {
        Self {
            product_category: None,
            product_type: None,
            ..self.clone()
        }
    }

    fn tags_match(&self, m: &MovementRecord) -> bool {
        eq_opt_field(&self.product_category, m.product_category.as_deref())
            && eq_opt_field(&self.product_type, m.product_type.as_deref())
    }
}

/// Query behind the current-inventory view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockQuery {
    /// Narrows the movements before projecting. Category and product type
    /// select whole batches.
    pub movements: MovementFilter,
    /// Case-insensitive substring over the projected rows' descriptive fields.
    pub search: Option<String>,
    /// Keep batches whose current stock is zero.
    pub include_depleted: bool,
}

impl StockQuery {
    /// Stock that can still be issued at a location.
    pub fn available_at(location_id: impl Into<String>) -> Self {
        Self {
            movements: MovementFilter::for_location(location_id),
            ..Self::default()
        }
    }

    pub fn run<'a>(&self, movements: impl IntoIterator<Item = &'a MovementRecord>) -> StockProjection {
        let filter = &self.movements;
        let movements: Vec<&MovementRecord> = movements.into_iter().collect();

        let mut projection = if filter.has_tag_filter() {
            let tagged: HashSet<BatchKey> = movements
                .iter()
                .filter(|m| filter.tags_match(m))
                .map(|m| m.key())
                .collect();
            let rest = filter.without_tags();
            project_stock(
                movements
                    .into_iter()
                    .filter(|m| tagged.contains(&m.key()) && rest.matches(m)),
            )
        } else {
            project_stock(filter.apply(movements))
        };

        if !self.include_depleted {
            projection = filter_depleted(projection);
        }
        if let Some(n) = needle(&self.search) {
            projection.retain(|row| row_matches(row, &n));
        }
        projection
    }
}

fn row_matches(row: &BatchStock, needle: &str) -> bool {
    [
        Some(row.batch_id.as_str()),
        row.production_batch_id.as_deref(),
        row.product_type.as_deref(),
        row.product_category.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|h| h.to_lowercase().contains(needle))
}

fn needle(search: &Option<String>) -> Option<String> {
    search
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

fn eq_opt(wanted: &Option<String>, actual: &str) -> bool {
    wanted.as_deref().is_none_or(|w| w.trim() == actual)
}

fn eq_opt_field(wanted: &Option<String>, actual: Option<&str>) -> bool {
    match wanted.as_deref() {
        None => true,
        Some(w) => actual.is_some_and(|a| a.eq_ignore_ascii_case(w.trim())),
    }
}
