//! Count corrections: a recorded difference between what the ledger says and
//! what was physically found, booked only after a separate approval.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{
    AggregateRoot, BusinessId, CorrectionId, DomainError, DomainResult, LedgerEntryId, TransferId,
    UserId,
};
use stockflow_events::Event;

use crate::dimension::Dimension;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStatus {
    Pending,
    Approved,
    Rejected,
}

impl CorrectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrectionStatus::Pending => "pending",
            CorrectionStatus::Approved => "approved",
            CorrectionStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for CorrectionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CorrectionStatus::Pending),
            "approved" => Ok(CorrectionStatus::Approved),
            "rejected" => Ok(CorrectionStatus::Rejected),
            other => Err(DomainError::validation(format!(
                "unknown correction status '{other}'"
            ))),
        }
    }
}

/// Why the correction exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectionSource {
    /// A stock count disagreed with the snapshot.
    PhysicalCount,
    /// A transfer arrived with a different quantity than was sent.
    TransferDiscrepancy { transfer_id: TransferId },
}

/// Input for recording a physical count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCorrection {
    pub dimension: Dimension,
    pub physical_count: i64,
    pub reason: Option<String>,
}

impl NewCorrection {
    pub fn new(dimension: Dimension, physical_count: i64) -> Self {
        Self {
            dimension,
            physical_count,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// What approving a correction should do to the ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Post `difference` as a `correction` entry, then link it.
    Apply,
    /// Confirm a transfer discrepancy. The `transfer_in` entry already
    /// booked the counted quantity, so nothing is posted.
    Acknowledge,
    /// Already approved; the linked entry, if any, is the answer.
    AlreadyApproved(Option<LedgerEntryId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub id: CorrectionId,
    pub business_id: BusinessId,
    pub number: String,
    pub dimension: Dimension,
    pub system_count: i64,
    pub physical_count: i64,
    /// `physical_count - system_count`; never zero.
    pub difference: i64,
    pub status: CorrectionStatus,
    pub source: CorrectionSource,
    pub reason: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub decided_by: Option<UserId>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Set once, on approval.
    pub linked_ledger_entry_id: Option<LedgerEntryId>,
    pub version: u64,
}

impl AggregateRoot for Correction {
    type Id = CorrectionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Correction {
    /// Record a count against the system quantity read under lock.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        id: CorrectionId,
        business_id: BusinessId,
        number: String,
        new: NewCorrection,
        system_count: i64,
        source: CorrectionSource,
        actor_id: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<(Self, CorrectionEvent)> {
        if new.physical_count < 0 {
            return Err(DomainError::validation("physical count cannot be negative"));
        }
        let difference = new
            .physical_count
            .checked_sub(system_count)
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;
        if difference == 0 {
            return Err(DomainError::validation(format!(
                "count of {} matches the system quantity; nothing to correct",
                new.physical_count
            )));
        }

        let correction = Self {
            id,
            business_id,
            number,
            dimension: new.dimension,
            system_count,
            physical_count: new.physical_count,
            difference,
            status: CorrectionStatus::Pending,
            source,
            reason: new.reason,
            created_by: actor_id,
            created_at: at,
            decided_by: None,
            decided_at: None,
            linked_ledger_entry_id: None,
            version: 1,
        };

        let event = CorrectionEvent::Recorded {
            correction_id: id,
            business_id,
            number: correction.number.clone(),
            dimension: correction.dimension,
            difference,
            source,
            actor_id,
            occurred_at: at,
        };

        Ok((correction, event))
    }

    /// Decide what an approval must do, without changing anything.
    pub fn approval_outcome(&self) -> DomainResult<ApprovalOutcome> {
        match (self.status, self.linked_ledger_entry_id) {
            (CorrectionStatus::Pending, _) if self.books_on_approval() => {
                Ok(ApprovalOutcome::Apply)
            }
            (CorrectionStatus::Pending, _) => Ok(ApprovalOutcome::Acknowledge),
            (CorrectionStatus::Approved, None) if self.books_on_approval() => {
                Err(DomainError::invariant(format!(
                    "correction {} is approved but has no ledger entry",
                    self.number
                )))
            }
            (CorrectionStatus::Approved, linked) => Ok(ApprovalOutcome::AlreadyApproved(linked)),
            (CorrectionStatus::Rejected, _) => Err(DomainError::conflict(format!(
                "correction {} was rejected",
                self.number
            ))),
        }
    }

    /// Whether approval posts `difference` to the ledger. Transfer
    /// discrepancies were already booked by the receipt itself.
    pub fn books_on_approval(&self) -> bool {
        matches!(self.source, CorrectionSource::PhysicalCount)
    }

    /// Mark approved. `entry_id` is the entry that booked the difference,
    /// and must be absent for a transfer discrepancy.
    pub fn approve(
        &mut self,
        entry_id: Option<LedgerEntryId>,
        actor_id: UserId,
        at: DateTime<Utc>,
    ) -> DomainResult<CorrectionEvent> {
        match (self.approval_outcome()?, entry_id) {
            (ApprovalOutcome::Apply, Some(_)) | (ApprovalOutcome::Acknowledge, None) => {}
            (ApprovalOutcome::Apply, None) => {
                return Err(DomainError::invariant(format!(
                    "correction {} needs a ledger entry to be approved",
                    self.number
                )));
            }
            (ApprovalOutcome::Acknowledge, Some(_)) => {
                return Err(DomainError::invariant(format!(
                    "correction {} was booked by its transfer; nothing to link",
                    self.number
                )));
            }
            (ApprovalOutcome::AlreadyApproved(_), _) => {
                return Err(DomainError::conflict(format!(
                    "correction {} already approved",
                    self.number
                )));
            }
        }

        self.status = CorrectionStatus::Approved;
        self.linked_ledger_entry_id = entry_id;
        self.decided_by = Some(actor_id);
        self.decided_at = Some(at);
        self.version += 1;

        Ok(CorrectionEvent::Approved {
            correction_id: self.id,
            ledger_entry_id: entry_id,
            actor_id,
            occurred_at: at,
        })
    }

    /// Reject a pending correction. Rejecting twice is a no-op (`Ok(None)`).
    pub fn reject(
        &mut self,
        actor_id: UserId,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> DomainResult<Option<CorrectionEvent>> {
        match self.status {
            CorrectionStatus::Rejected => return Ok(None),
            CorrectionStatus::Approved => {
                return Err(DomainError::conflict(format!(
                    "correction {} was already approved",
                    self.number
                )));
            }
            CorrectionStatus::Pending => {}
        }

        self.status = CorrectionStatus::Rejected;
        self.decided_by = Some(actor_id);
        self.decided_at = Some(at);
        if reason.is_some() {
            self.reason = reason.clone();
        }
        self.version += 1;

        Ok(Some(CorrectionEvent::Rejected {
            correction_id: self.id,
            actor_id,
            reason,
            occurred_at: at,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionEvent {
    Recorded {
        correction_id: CorrectionId,
        business_id: BusinessId,
        number: String,
        dimension: Dimension,
        difference: i64,
        source: CorrectionSource,
        actor_id: UserId,
        occurred_at: DateTime<Utc>,
    },
    Approved {
        correction_id: CorrectionId,
        ledger_entry_id: Option<LedgerEntryId>,
        actor_id: UserId,
        occurred_at: DateTime<Utc>,
    },
    Rejected {
        correction_id: CorrectionId,
        actor_id: UserId,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for CorrectionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CorrectionEvent::Recorded { .. } => "inventory.correction.recorded",
            CorrectionEvent::Approved { .. } => "inventory.correction.approved",
            CorrectionEvent::Rejected { .. } => "inventory.correction.rejected",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CorrectionEvent::Recorded { occurred_at, .. }
            | CorrectionEvent::Approved { occurred_at, .. }
            | CorrectionEvent::Rejected { occurred_at, .. } => *occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{LocationId, ProductVariantId};

    fn pending(system: i64, physical: i64) -> Correction {
        let dim = Dimension::new(ProductVariantId::new(), LocationId::new());
        Correction::record(
            CorrectionId::new(),
            BusinessId::new(),
            "COR-MAIN-20261019-0001".into(),
            NewCorrection::new(dim, physical),
            system,
            CorrectionSource::PhysicalCount,
            UserId::new(),
            Utc::now(),
        )
        .unwrap()
        .0
    }

    #[test]
    fn difference_is_physical_minus_system() {
        let c = pending(40, 37);
        assert_eq!(c.difference, -3);
        assert_eq!(c.status, CorrectionStatus::Pending);
    }

    #[test]
    fn matching_count_is_rejected() {
        let dim = Dimension::new(ProductVariantId::new(), LocationId::new());
        let err = Correction::record(
            CorrectionId::new(),
            BusinessId::new(),
            "n".into(),
            NewCorrection::new(dim, 12),
            12,
            CorrectionSource::PhysicalCount,
            UserId::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn second_approval_reports_the_existing_entry() {
        let mut c = pending(10, 12);
        let entry = LedgerEntryId::new();
        c.approve(Some(entry), UserId::new(), Utc::now()).unwrap();

        assert_eq!(
            c.approval_outcome().unwrap(),
            ApprovalOutcome::AlreadyApproved(Some(entry))
        );
        assert!(c.approve(Some(LedgerEntryId::new()), UserId::new(), Utc::now()).is_err());
        assert_eq!(c.linked_ledger_entry_id, Some(entry));
    }

    #[test]
    fn count_corrections_need_an_entry() {
        let mut c = pending(10, 12);
        assert!(matches!(
            c.approve(None, UserId::new(), Utc::now()),
            Err(DomainError::InvariantViolation(_))
        ));
        assert_eq!(c.status, CorrectionStatus::Pending);
    }

    #[test]
    fn transfer_discrepancy_is_acknowledged_without_an_entry() {
        let dim = Dimension::new(ProductVariantId::new(), LocationId::new());
        let (mut c, _) = Correction::record(
            CorrectionId::new(),
            BusinessId::new(),
            "COR-MAIN-20261019-0002".into(),
            NewCorrection::new(dim, 28),
            30,
            CorrectionSource::TransferDiscrepancy {
                transfer_id: TransferId::new(),
            },
            UserId::new(),
            Utc::now(),
        )
        .unwrap();
        assert!(!c.books_on_approval());
        assert_eq!(c.approval_outcome().unwrap(), ApprovalOutcome::Acknowledge);
        assert!(c.approve(Some(LedgerEntryId::new()), UserId::new(), Utc::now()).is_err());

        let event = c.approve(None, UserId::new(), Utc::now()).unwrap();
        assert!(matches!(
            event,
            CorrectionEvent::Approved {
                ledger_entry_id: None,
                ..
            }
        ));
        assert_eq!(c.status, CorrectionStatus::Approved);
        assert_eq!(c.approval_outcome().unwrap(), ApprovalOutcome::AlreadyApproved(None));
    }

    #[test]
    fn reject_is_idempotent_but_final() {
        let mut c = pending(10, 12);
        assert!(c.reject(UserId::new(), Utc::now(), None).unwrap().is_some());
        assert!(c.reject(UserId::new(), Utc::now(), None).unwrap().is_none());
        assert!(matches!(c.approval_outcome(), Err(DomainError::Conflict(_))));
        assert_eq!(c.version, 2);
    }

    #[test]
    fn approved_corrections_cannot_be_rejected() {
        let mut c = pending(10, 12);
        c.approve(Some(LedgerEntryId::new()), UserId::new(), Utc::now()).unwrap();
        assert!(matches!(
            c.reject(UserId::new(), Utc::now(), None),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn source_serializes_with_a_kind_tag() {
        let id = TransferId::new();
        let json = serde_json::to_value(CorrectionSource::TransferDiscrepancy { transfer_id: id })
            .unwrap();
        assert_eq!(json["kind"], "transfer_discrepancy");
        assert_eq!(json["transfer_id"], id.to_string());
    }
}
