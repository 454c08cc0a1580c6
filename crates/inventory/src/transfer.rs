use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    Aggregate, AggregateRoot, BusinessId, DomainError, LocationId, ProductVariantId, TransferId,
    UserId,
};
use stockflow_events::Event;

use crate::dimension::Dimension;

/// Lifecycle of an inter-location transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    PendingApproval,
    Approved,
    Sent,
    Arrived,
    Verifying,
    Verified,
    Completed,
    Rejected,
    Cancelled,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 10] = [
        TransferStatus::Draft,
        TransferStatus::PendingApproval,
        TransferStatus::Approved,
        TransferStatus::Sent,
        TransferStatus::Arrived,
        TransferStatus::Verifying,
        TransferStatus::Verified,
        TransferStatus::Completed,
        TransferStatus::Rejected,
        TransferStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Draft => "draft",
            TransferStatus::PendingApproval => "pending_approval",
            TransferStatus::Approved => "approved",
            TransferStatus::Sent => "sent",
            TransferStatus::Arrived => "arrived",
            TransferStatus::Verifying => "verifying",
            TransferStatus::Verified => "verified",
            TransferStatus::Completed => "completed",
            TransferStatus::Rejected => "rejected",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Rejected | TransferStatus::Cancelled
        )
    }

    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            TransferStatus::Draft
                | TransferStatus::PendingApproval
                | TransferStatus::Approved
                | TransferStatus::Sent
                | TransferStatus::Arrived
                | TransferStatus::Verifying
        )
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown transfer status '{s}'")))
    }
}

/// One line of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub variant_id: ProductVariantId,
    pub qty_requested: i64,
    pub qty_verified: Option<i64>,
}

impl TransferItem {
    /// Counted minus requested; `None` before verification.
    pub fn discrepancy(&self) -> Option<i64> {
        self.qty_verified.map(|v| v - self.qty_requested)
    }
}

/// Who moved the transfer into a status, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub status: TransferStatus,
    pub actor_id: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransferItem {
    pub variant_id: ProductVariantId,
    pub qty: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransfer {
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub items: Vec<NewTransferItem>,
    pub note: Option<String>,
}

impl NewTransfer {
    pub fn new(from_location: LocationId, to_location: LocationId) -> Self {
        Self {
            from_location,
            to_location,
            items: Vec::new(),
            note: None,
        }
    }

    pub fn with_item(mut self, variant_id: ProductVariantId, qty: i64) -> Self {
        self.items.push(NewTransferItem { variant_id, qty });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.from_location == self.to_location {
            return Err(DomainError::validation(
                "source and destination locations must differ",
            ));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation("a transfer needs at least one item"));
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.qty <= 0 {
                return Err(DomainError::validation(format!(
                    "item {} quantity must be positive, got {}",
                    item.variant_id, item.qty
                )));
            }
            if self.items[..i].iter().any(|o| o.variant_id == item.variant_id) {
                return Err(DomainError::validation(format!(
                    "variant {} appears more than once",
                    item.variant_id
                )));
            }
        }
        Ok(())
    }
}

/// Physical count for one transfer line at the destination.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedCount {
    pub variant_id: ProductVariantId,
    pub qty_verified: i64,
}

impl VerifiedCount {
    pub fn new(variant_id: ProductVariantId, qty_verified: i64) -> Self {
        Self {
            variant_id,
            qty_verified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferAction {
    Submit,
    Approve,
    Reject { reason: Option<String> },
    Send,
    MarkArrived,
    StartVerification,
    Verify { counts: Vec<VerifiedCount> },
    Complete,
    Cancel { reason: Option<String> },
}

impl TransferAction {
    pub fn name(&self) -> &'static str {
        match self {
            TransferAction::Submit => "submit",
            TransferAction::Approve => "approve",
            TransferAction::Reject { .. } => "reject",
            TransferAction::Send => "send",
            TransferAction::MarkArrived => "mark_arrived",
            TransferAction::StartVerification => "start_verification",
            TransferAction::Verify { .. } => "verify",
            TransferAction::Complete => "complete",
            TransferAction::Cancel { .. } => "cancel",
        }
    }

    /// Status the transfer is in after this action succeeds.
    pub fn target_status(&self) -> TransferStatus {
        match self {
            TransferAction::Submit => TransferStatus::PendingApproval,
            TransferAction::Approve => TransferStatus::Approved,
            TransferAction::Reject { .. } => TransferStatus::Rejected,
            TransferAction::Send => TransferStatus::Sent,
            TransferAction::MarkArrived => TransferStatus::Arrived,
            TransferAction::StartVerification => TransferStatus::Verifying,
            TransferAction::Verify { .. } => TransferStatus::Verified,
            TransferAction::Complete => TransferStatus::Completed,
            TransferAction::Cancel { .. } => TransferStatus::Cancelled,
        }
    }

    fn allowed_from(&self, status: TransferStatus) -> bool {
        match self {
            TransferAction::Submit => status == TransferStatus::Draft,
            TransferAction::Approve | TransferAction::Reject { .. } => {
                status == TransferStatus::PendingApproval
            }
            TransferAction::Send => status == TransferStatus::Approved,
            TransferAction::MarkArrived => status == TransferStatus::Sent,
            TransferAction::StartVerification => status == TransferStatus::Arrived,
            TransferAction::Verify { .. } => status == TransferStatus::Verifying,
            TransferAction::Complete => status == TransferStatus::Verified,
            TransferAction::Cancel { .. } => status.is_cancellable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommand {
    pub actor_id: UserId,
    pub occurred_at: DateTime<Utc>,
    pub action: TransferAction,
}

impl TransferCommand {
    pub fn new(actor_id: UserId, occurred_at: DateTime<Utc>, action: TransferAction) -> Self {
        Self {
            actor_id,
            occurred_at,
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    Created {
        transfer_id: TransferId,
        business_id: BusinessId,
        number: String,
        from_location: LocationId,
        to_location: LocationId,
        items: Vec<NewTransferItem>,
        note: Option<String>,
        actor_id: UserId,
        occurred_at: DateTime<Utc>,
    },
    /// Source stock left the building; one `transfer_out` per item.
    StockDeducted {
        transfer_id: TransferId,
        occurred_at: DateTime<Utc>,
    },
    /// Destination counts recorded; one `transfer_in` per non-zero count.
    ItemsVerified {
        transfer_id: TransferId,
        counts: Vec<VerifiedCount>,
        occurred_at: DateTime<Utc>,
    },
    /// Source stock restored; one `transfer_out_reversal` per item.
    DeductionReversed {
        transfer_id: TransferId,
        occurred_at: DateTime<Utc>,
    },
    StatusChanged {
        transfer_id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
        actor_id: UserId,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for TransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::Created { .. } => "inventory.transfer.created",
            TransferEvent::StockDeducted { .. } => "inventory.transfer.stock_deducted",
            TransferEvent::ItemsVerified { .. } => "inventory.transfer.items_verified",
            TransferEvent::DeductionReversed { .. } => "inventory.transfer.deduction_reversed",
            TransferEvent::StatusChanged { .. } => "inventory.transfer.status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferEvent::Created { occurred_at, .. }
            | TransferEvent::StockDeducted { occurred_at, .. }
            | TransferEvent::ItemsVerified { occurred_at, .. }
            | TransferEvent::DeductionReversed { occurred_at, .. }
            | TransferEvent::StatusChanged { occurred_at, .. } => *occurred_at,
        }
    }
}

/// Aggregate root: a stock movement between two locations of one business.
///
/// Ledger postings implied by `StockDeducted`, `ItemsVerified` and
/// `DeductionReversed` are carried out by the caller in the same unit of work
/// that persists the new state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub business_id: BusinessId,
    pub number: String,
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub status: TransferStatus,
    /// Flips false -> true once, when the source entries are written.
    pub stock_deducted: bool,
    /// Set when a cancellation restored the source. `stock_deducted` stays true.
    pub deduction_reversed: bool,
    pub items: Vec<TransferItem>,
    pub transitions: Vec<TransitionRecord>,
    pub note: Option<String>,
    pub status_reason: Option<String>,
    pub version: u64,
}

impl Transfer {
    /// Not-yet-created instance for rehydration.
    pub fn empty(id: TransferId, business_id: BusinessId) -> Self {
        Self {
            id,
            business_id,
            number: String::new(),
            from_location: LocationId::from_uuid(uuid::Uuid::nil()),
            to_location: LocationId::from_uuid(uuid::Uuid::nil()),
            status: TransferStatus::Draft,
            stock_deducted: false,
            deduction_reversed: false,
            items: Vec::new(),
            transitions: Vec::new(),
            note: None,
            status_reason: None,
            version: 0,
        }
    }

    /// Validate and open a new transfer in `draft`.
    pub fn create(
        id: TransferId,
        business_id: BusinessId,
        number: String,
        new: NewTransfer,
        actor_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<(Self, TransferEvent), DomainError> {
        new.validate()?;

        let event = TransferEvent::Created {
            transfer_id: id,
            business_id,
            number,
            from_location: new.from_location,
            to_location: new.to_location,
            items: new.items,
            note: new.note,
            actor_id,
            occurred_at: at,
        };

        let mut transfer = Transfer::empty(id, business_id);
        transfer.apply(&event);
        Ok((transfer, event))
    }

    /// Latest actor who moved the transfer into `status`.
    pub fn actor_of(&self, status: TransferStatus) -> Option<UserId> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.status == status)
            .map(|t| t.actor_id)
    }

    pub fn has_passed(&self, status: TransferStatus) -> bool {
        self.transitions.iter().any(|t| t.status == status)
    }

    /// Completed or cancelled (or rejected): kept for audit, never moved again.
    pub fn is_retired(&self) -> bool {
        self.status.is_terminal()
    }

    /// Destination counts have been booked.
    pub fn is_received(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Verified | TransferStatus::Completed
        )
    }

    pub fn source_dimension(&self, variant_id: ProductVariantId) -> Dimension {
        Dimension::new(variant_id, self.from_location)
    }

    pub fn destination_dimension(&self, variant_id: ProductVariantId) -> Dimension {
        Dimension::new(variant_id, self.to_location)
    }

    /// Dimensions whose snapshots `events` will post to, in lock order.
    pub fn dimensions_touched_by(&self, events: &[TransferEvent]) -> Vec<Dimension> {
        let mut dims: Vec<Dimension> = Vec::new();
        for event in events {
            match event {
                TransferEvent::StockDeducted { .. } | TransferEvent::DeductionReversed { .. } => {
                    dims.extend(self.items.iter().map(|i| self.source_dimension(i.variant_id)));
                }
                TransferEvent::ItemsVerified { counts, .. } => dims.extend(
                    counts
                        .iter()
                        .filter(|c| c.qty_verified > 0)
                        .map(|c| self.destination_dimension(c.variant_id)),
                ),
                TransferEvent::Created { .. } | TransferEvent::StatusChanged { .. } => {}
            }
        }
        dims.sort();
        dims.dedup();
        dims
    }

    /// Lines whose verified count differs from the requested quantity.
    pub fn discrepancies(&self) -> impl Iterator<Item = (&TransferItem, i64)> {
        self.items
            .iter()
            .filter_map(|i| i.discrepancy().filter(|d| *d != 0).map(|d| (i, d)))
    }

    fn validate_counts(&self, counts: &[VerifiedCount]) -> Result<(), DomainError> {
        for (i, count) in counts.iter().enumerate() {
            if count.qty_verified < 0 {
                return Err(DomainError::validation(format!(
                    "verified quantity for {} cannot be negative",
                    count.variant_id
                )));
            }
            if !self.items.iter().any(|it| it.variant_id == count.variant_id) {
                return Err(DomainError::validation(format!(
                    "variant {} is not part of transfer {}",
                    count.variant_id, self.number
                )));
            }
            if counts[..i].iter().any(|o| o.variant_id == count.variant_id) {
                return Err(DomainError::validation(format!(
                    "variant {} counted more than once",
                    count.variant_id
                )));
            }
        }
        if let Some(missing) = self
            .items
            .iter()
            .find(|it| !counts.iter().any(|c| c.variant_id == it.variant_id))
        {
            return Err(DomainError::validation(format!(
                "missing verified count for {}",
                missing.variant_id
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for Transfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::Created {
                transfer_id,
                business_id,
                number,
                from_location,
                to_location,
                items,
                note,
                actor_id,
                occurred_at,
            } => {
                self.id = *transfer_id;
                self.business_id = *business_id;
                self.number = number.clone();
                self.from_location = *from_location;
                self.to_location = *to_location;
                self.items = items
                    .iter()
                    .map(|i| TransferItem {
                        variant_id: i.variant_id,
                        qty_requested: i.qty,
                        qty_verified: None,
                    })
                    .collect();
                self.note = note.clone();
                self.status = TransferStatus::Draft;
                self.transitions = vec![TransitionRecord {
                    status: TransferStatus::Draft,
                    actor_id: *actor_id,
                    at: *occurred_at,
                }];
            }
            TransferEvent::StockDeducted { .. } => {
                self.stock_deducted = true;
            }
            TransferEvent::ItemsVerified { counts, .. } => {
                for count in counts {
                    if let Some(item) = self
                        .items
                        .iter_mut()
                        .find(|i| i.variant_id == count.variant_id)
                    {
                        item.qty_verified = Some(count.qty_verified);
                    }
                }
            }
            TransferEvent::DeductionReversed { .. } => {
                self.deduction_reversed = true;
            }
            TransferEvent::StatusChanged {
                to,
                actor_id,
                reason,
                occurred_at,
                ..
            } => {
                self.status = *to;
                self.status_reason = reason.clone();
                self.transitions.push(TransitionRecord {
                    status: *to,
                    actor_id: *actor_id,
                    at: *occurred_at,
                });
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let action = &command.action;
        if !action.allowed_from(self.status) {
            return Err(DomainError::conflict(format!(
                "cannot {} transfer {} in status {}",
                action.name(),
                self.number,
                self.status
            )));
        }

        let mut events = Vec::with_capacity(2);
        let mut reason = None;

        match action {
            TransferAction::Send => {
                if self.stock_deducted {
                    return Err(DomainError::invariant(format!(
                        "transfer {} already deducted stock",
                        self.number
                    )));
                }
                events.push(TransferEvent::StockDeducted {
                    transfer_id: self.id,
                    occurred_at: command.occurred_at,
                });
            }
            TransferAction::Verify { counts } => {
                self.validate_counts(counts)?;
                events.push(TransferEvent::ItemsVerified {
                    transfer_id: self.id,
                    counts: counts.clone(),
                    occurred_at: command.occurred_at,
                });
            }
            TransferAction::Cancel { reason: r } => {
                if self.stock_deducted && !self.deduction_reversed {
                    events.push(TransferEvent::DeductionReversed {
                        transfer_id: self.id,
                        occurred_at: command.occurred_at,
                    });
                }
                reason = r.clone();
            }
            TransferAction::Reject { reason: r } => reason = r.clone(),
            TransferAction::Submit
            | TransferAction::Approve
            | TransferAction::MarkArrived
            | TransferAction::StartVerification
            | TransferAction::Complete => {}
        }

        events.push(TransferEvent::StatusChanged {
            transfer_id: self.id,
            from: self.status,
            to: action.target_status(),
            actor_id: command.actor_id,
            reason,
            occurred_at: command.occurred_at,
        });

        Ok(events)
    }
}
