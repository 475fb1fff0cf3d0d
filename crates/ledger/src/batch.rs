use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{Aggregate, AggregateRoot, MovementId, TenantId, UserId};
use stockledger_events::Event;

use crate::error::LedgerError;
use crate::movement::{BatchKey, Direction, MovementCandidate, MovementRecord};

/// Aggregate root: the movement stream of one batch in one location.
///
/// Rehydrated from the batch's stream before every decision, so the
/// availability check always sees every movement committed so far. The store
/// rejects the append if the stream moved on in the meantime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLedger {
    tenant_id: TenantId,
    key: BatchKey,
    received: Decimal,
    issued: Decimal,
    receipts: u64,
    version: u64,
    movements: HashMap<MovementId, MovementRecord>,
    reversed: HashSet<MovementId>,
}

impl BatchLedger {
    /// Create an empty instance for rehydration.
    pub fn empty(tenant_id: TenantId, key: BatchKey) -> Self {
        Self {
            tenant_id,
            key,
            received: Decimal::ZERO,
            issued: Decimal::ZERO,
            receipts: 0,
            version: 0,
            movements: HashMap::new(),
            reversed: HashSet::new(),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn received(&self) -> Decimal {
        self.received
    }

    pub fn issued(&self) -> Decimal {
        self.issued
    }

    /// Stock currently available for issue.
    pub fn available(&self) -> Decimal {
        self.received.saturating_sub(self.issued)
    }

    pub fn movement(&self, id: MovementId) -> Option<&MovementRecord> {
        self.movements.get(&id)
    }

    pub fn is_reversed(&self, id: MovementId) -> bool {
        self.reversed.contains(&id)
    }
}

impl AggregateRoot for BatchLedger {
    type Id = BatchKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: record a receipt or issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMovement {
    pub tenant_id: TenantId,
    pub movement_id: MovementId,
    pub candidate: MovementCandidate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: cancel an earlier movement with a compensating entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseMovement {
    pub tenant_id: TenantId,
    pub key: BatchKey,
    pub target: MovementId,
    pub reversal_id: MovementId,
    pub operator_id: Option<UserId>,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    Record(RecordMovement),
    Reverse(ReverseMovement),
}

impl LedgerCommand {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            LedgerCommand::Record(c) => c.tenant_id,
            LedgerCommand::Reverse(c) => c.tenant_id,
        }
    }

    /// Stream the command targets.
    pub fn key(&self) -> BatchKey {
        match self {
            LedgerCommand::Record(c) => c.candidate.key(),
            LedgerCommand::Reverse(c) => c.key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    MovementRecorded(MovementRecord),
}

impl LedgerEvent {
    pub fn record(&self) -> &MovementRecord {
        let LedgerEvent::MovementRecorded(r) = self;
        r
    }

    pub fn into_record(self) -> MovementRecord {
        let LedgerEvent::MovementRecorded(r) = self;
        r
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::MovementRecorded(_) => "ledger.movement.recorded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.record().occurred_at
    }
}

impl Aggregate for BatchLedger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = LedgerError;

    fn apply(&mut self, event: &Self::Event) {
        let LedgerEvent::MovementRecorded(m) = event;
        // An overflowing stored movement takes a version but stays out of the totals.
        match m.direction {
            Direction::In => match self.received.checked_add(m.quantity) {
                Some(total) => {
                    self.received = total;
                    self.receipts += 1;
                }
                None => overflow_skipped(&self.key, m),
            },
            Direction::Out => match self.issued.checked_add(m.quantity) {
                Some(total) => self.issued = total,
                None => overflow_skipped(&self.key, m),
            },
        }
        if let Some(target) = m.reverses {
            self.reversed.insert(target);
        }
        self.movements.insert(m.id, m.clone());

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.tenant_id() != self.tenant_id {
            return Err(LedgerError::TenantMismatch);
        }
        match command {
            LedgerCommand::Record(cmd) => self.handle_record(cmd),
            LedgerCommand::Reverse(cmd) => self.handle_reverse(cmd),
        }
    }
}

fn overflow_skipped(key: &BatchKey, m: &MovementRecord) {
    tracing::warn!(
        stream = %key,
        movement_id = %m.id,
        quantity = %m.quantity,
        "movement overflows batch totals; excluded"
    );
}

impl BatchLedger {
    /// A receipt must keep the running total representable.
    fn ensure_can_receive(&self, quantity: Decimal) -> Result<(), LedgerError> {
        match self.received.checked_add(quantity) {
            Some(_) => Ok(()),
            None => Err(LedgerError::InvalidQuantity(format!(
                "receiving {quantity} would exceed the largest quantity batch {} can hold",
                self.key
            ))),
        }
    }

    fn ensure_can_issue(&self, requested: Decimal) -> Result<(), LedgerError> {
        if self.receipts == 0 {
            return Err(LedgerError::BatchNotFound(self.key.clone()));
        }
        let available = self.available();
        if requested > available {
            return Err(LedgerError::InsufficientStock {
                key: self.key.clone(),
                requested,
                available,
            });
        }
        Ok(())
    }

    fn handle_record(&self, cmd: &RecordMovement) -> Result<Vec<LedgerEvent>, LedgerError> {
        let (key, direction, quantity) = cmd.candidate.validate()?;
        if key != self.key {
            return Err(LedgerError::validation(format!(
                "movement for {key} routed to batch {}",
                self.key
            )));
        }

        match direction {
            Direction::In => self.ensure_can_receive(quantity)?,
            Direction::Out => self.ensure_can_issue(quantity)?,
        }

        let c = &cmd.candidate;
        Ok(vec![LedgerEvent::MovementRecorded(MovementRecord {
            id: cmd.movement_id,
            tenant_id: cmd.tenant_id,
            location_id: key.location_id,
            batch_id: key.batch_id,
            production_batch_id: c.production_batch_id.clone(),
            product_type: c.product_type.clone(),
            product_category: c.product_category.clone(),
            direction,
            quantity,
            unit_weight: c.unit_weight.clone(),
            occurred_at: cmd.occurred_at,
            operator_id: c.operator_id,
            reference: c.reference.clone(),
            reverses: None,
        })])
    }

    fn handle_reverse(&self, cmd: &ReverseMovement) -> Result<Vec<LedgerEvent>, LedgerError> {
        if cmd.key != self.key {
            return Err(LedgerError::validation(format!(
                "reversal for {} routed to batch {}",
                cmd.key, self.key
            )));
        }

        let original = self
            .movements
            .get(&cmd.target)
            .ok_or_else(|| LedgerError::MovementNotFound {
                key: self.key.clone(),
                movement_id: cmd.target,
            })?;

        if original.reverses.is_some() {
            return Err(LedgerError::validation("a reversal cannot itself be reversed"));
        }
        if self.reversed.contains(&cmd.target) {
            return Err(LedgerError::AlreadyReversed(cmd.target));
        }

        let direction = original.direction.opposite();
        match direction {
            Direction::In => self.ensure_can_receive(original.quantity)?,
            Direction::Out => self.ensure_can_issue(original.quantity)?,
        }

        let reference = match &cmd.reason {
            Some(reason) => format!("reversal of {}: {reason}", original.id),
            None => format!("reversal of {}", original.id),
        };

        Ok(vec![LedgerEvent::MovementRecorded(MovementRecord {
            id: cmd.reversal_id,
            tenant_id: cmd.tenant_id,
            location_id: original.location_id.clone(),
            batch_id: original.batch_id.clone(),
            production_batch_id: original.production_batch_id.clone(),
            product_type: original.product_type.clone(),
            product_category: original.product_category.clone(),
            direction,
            quantity: original.quantity,
            unit_weight: original.unit_weight.clone(),
            occurred_at: cmd.occurred_at,
            operator_id: cmd.operator_id,
            reference: Some(reference),
            reverses: Some(original.id),
        })])
    }
}
