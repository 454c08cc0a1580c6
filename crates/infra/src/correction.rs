//! Stock corrections: a physical count recorded against the system quantity,
//! booked to the ledger only once someone approves it. Transfer discrepancies
//! are already booked by their receipt; approving one only confirms it.

use chrono::Utc;
use tracing::{info, instrument};

use stockflow_auth::{Principal, SeparationOfDuties};
use stockflow_core::{BusinessId, CorrectionId, LedgerEntryId};
use stockflow_inventory::{
    ApprovalOutcome, Correction, CorrectionEvent, CorrectionSource, CorrectionStatus, DocumentKind,
    LedgerDraft, LedgerEntry, LedgerEntryType, NewCorrection, Reference,
};

use crate::capabilities;
use crate::engine::InventoryEngine;
use crate::error::{EngineError, EngineResult};
use crate::notify::{self, Stream};
use crate::store::{InventoryStore, UnitOfWork};

pub(crate) const CORRECTION_STREAM: &str = "inventory.correction";

/// Result of approving a correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionApproval {
    pub correction: Correction,
    /// The entry that booked the difference. Transfer discrepancies have
    /// none: their receipt already booked the counted quantity.
    pub entry: Option<LedgerEntry>,
    /// False when the correction had already been approved and nothing was posted.
    pub newly_applied: bool,
}

pub struct CorrectionWorkflow<'a, S> {
    engine: &'a InventoryEngine<S>,
}

impl<'a, S: InventoryStore> CorrectionWorkflow<'a, S> {
    pub(crate) fn new(engine: &'a InventoryEngine<S>) -> Self {
        Self { engine }
    }

    /// Record a physical count. The system count is read under the
    /// dimension's lock; nothing is posted to the ledger yet.
    #[instrument(
        skip(self, principal, new),
        fields(business_id = %principal.business_id(), dimension = %new.dimension),
        err
    )]
    pub fn record(&self, principal: &Principal, new: NewCorrection) -> EngineResult<Correction> {
        let business_id = self.engine.authorize(principal, &capabilities::CORRECTION_CREATE)?;
        if new.physical_count < 0 {
            return Err(EngineError::Validation(
                "physical count cannot be negative".to_string(),
            ));
        }

        let now = Utc::now();
        let number = self
            .engine
            .sequences()
            .next_document_number(
                DocumentKind::Correction,
                business_id,
                new.dimension.location_id,
                now,
            )?
            .to_string();

        let (correction, event) = self.engine.config.retry.run("correction.record", || {
            let mut uow = self.engine.store.begin()?;
            let system_count = uow
                .lock_snapshot(business_id, new.dimension)?
                .map(|s| s.qty_available)
                .unwrap_or(0);
            let recorded = Correction::record(
                CorrectionId::new(),
                business_id,
                number.clone(),
                new.clone(),
                system_count,
                CorrectionSource::PhysicalCount,
                principal.user_id,
                now,
            )?;
            uow.put_correction(&recorded.0)?;
            uow.commit()?;
            Ok(recorded)
        })?;

        info!(
            correction_id = %correction.id,
            number = %correction.number,
            difference = correction.difference,
            "correction recorded"
        );
        self.publish(&correction, &event);
        Ok(correction)
    }

    /// Approve and book the difference as a `correction` entry.
    ///
    /// A transfer discrepancy is approved without posting: the `transfer_in`
    /// entry already booked what was counted, so the approval only confirms
    /// the write-off. Idempotent: approving an approved correction returns
    /// the entry it already produced and posts nothing.
    #[instrument(
        skip(self, principal),
        fields(business_id = %principal.business_id(), correction_id = %correction_id),
        err
    )]
    pub fn approve(
        &self,
        principal: &Principal,
        correction_id: CorrectionId,
    ) -> EngineResult<CorrectionApproval> {
        let business_id = self.engine.authorize(principal, &capabilities::CORRECTION_APPROVE)?;

        let (approval, event) = self.engine.config.retry.run("correction.approve", || {
            let mut uow = self.engine.store.begin()?;
            let mut correction = self.lock(&mut uow, business_id, correction_id)?;

            let entry = match correction.approval_outcome()? {
                ApprovalOutcome::AlreadyApproved(linked) => {
                    let entry = match linked {
                        Some(entry_id) => Some(self.linked_entry(&correction, entry_id)?),
                        None => None,
                    };
                    let approval = CorrectionApproval {
                        correction,
                        entry,
                        newly_applied: false,
                    };
                    return Ok((approval, None));
                }
                ApprovalOutcome::Apply => {
                    self.check_duties(principal, &correction, CorrectionStatus::Approved)?;
                    let draft = LedgerDraft::new(
                        correction.dimension,
                        LedgerEntryType::Correction,
                        correction.difference,
                        Reference::correction(correction.id),
                    );
                    Some(self.engine.ledger().append_in(
                        &mut uow,
                        business_id,
                        &draft,
                        principal.user_id,
                    )?)
                }
                ApprovalOutcome::Acknowledge => {
                    self.check_duties(principal, &correction, CorrectionStatus::Approved)?;
                    None
                }
            };

            let event =
                correction.approve(entry.as_ref().map(|e| e.id), principal.user_id, Utc::now())?;
            uow.put_correction(&correction)?;
            uow.commit()?;
            let approval = CorrectionApproval {
                correction,
                entry,
                newly_applied: true,
            };
            Ok((approval, Some(event)))
        })?;

        if let Some(event) = event {
            info!(
                number = %approval.correction.number,
                entry_id = ?approval.entry.as_ref().map(|e| e.id),
                difference = approval.correction.difference,
                "correction approved"
            );
            self.publish(&approval.correction, &event);
            if let Some(entry) = &approval.entry {
                self.engine.ledger().publish_appended(entry);
            }
        }
        Ok(approval)
    }

    /// Reject a pending correction. Rejecting a rejected one changes nothing.
    #[instrument(
        skip(self, principal, reason),
        fields(business_id = %principal.business_id(), correction_id = %correction_id),
        err
    )]
    pub fn reject(
        &self,
        principal: &Principal,
        correction_id: CorrectionId,
        reason: Option<String>,
    ) -> EngineResult<Correction> {
        let business_id = self.engine.authorize(principal, &capabilities::CORRECTION_APPROVE)?;

        let (correction, event) = self.engine.config.retry.run("correction.reject", || {
            let mut uow = self.engine.store.begin()?;
            let mut correction = self.lock(&mut uow, business_id, correction_id)?;
            if correction.status == CorrectionStatus::Pending {
                self.check_duties(principal, &correction, CorrectionStatus::Rejected)?;
            }
            let event = correction.reject(principal.user_id, Utc::now(), reason.clone())?;
            if event.is_some() {
                uow.put_correction(&correction)?;
                uow.commit()?;
            }
            Ok((correction, event))
        })?;

        if let Some(event) = event {
            info!(number = %correction.number, "correction rejected");
            self.publish(&correction, &event);
        }
        Ok(correction)
    }

    pub fn get(
        &self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> EngineResult<Correction> {
        self.engine
            .store
            .correction(business_id, correction_id)?
            .ok_or_else(|| EngineError::not_found(format!("correction {correction_id}")))
    }

    /// Newest first.
    pub fn list(
        &self,
        business_id: BusinessId,
        status: Option<CorrectionStatus>,
    ) -> EngineResult<Vec<Correction>> {
        Ok(self.engine.store.corrections(business_id, status)?)
    }

    fn lock<U: UnitOfWork + ?Sized>(
        &self,
        uow: &mut U,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> EngineResult<Correction> {
        uow.lock_correction(business_id, correction_id)?
            .ok_or_else(|| EngineError::not_found(format!("correction {correction_id}")))
    }

    fn linked_entry(
        &self,
        correction: &Correction,
        entry_id: LedgerEntryId,
    ) -> EngineResult<LedgerEntry> {
        self.engine
            .store
            .entries_for_reference(correction.business_id, Reference::correction(correction.id))?
            .into_iter()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| {
                EngineError::consistency(
                    format!("correction {}", correction.number),
                    format!("linked ledger entry {entry_id} is missing"),
                )
            })
    }

    fn check_duties(
        &self,
        principal: &Principal,
        correction: &Correction,
        step: CorrectionStatus,
    ) -> EngineResult<()> {
        let policy = self.engine.policy(correction.business_id);
        SeparationOfDuties::new(&policy.correction_duties, &policy.sod_exempt_roles).check(
            principal,
            step,
            |status| match status {
                CorrectionStatus::Pending => Some(correction.created_by),
                CorrectionStatus::Approved | CorrectionStatus::Rejected => correction.decided_by,
            },
        )?;
        Ok(())
    }

    fn publish(&self, correction: &Correction, event: &CorrectionEvent) {
        notify::publish(
            self.engine.sink(),
            correction.business_id,
            Stream::new(correction.id, CORRECTION_STREAM, correction.version),
            event,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::{admin_of, dimension, engine, member_of, purchase, with_role};
    use stockflow_auth::Principal;
    use stockflow_core::UserId;

    fn stocked(
        qty: i64,
    ) -> (
        InventoryEngine<crate::store::InMemoryInventoryStore>,
        BusinessId,
        stockflow_inventory::Dimension,
    ) {
        let engine = engine();
        let business = BusinessId::new();
        let dim = dimension();
        engine.ledger().append(&admin_of(business), purchase(dim, qty)).unwrap();
        (engine, business, dim)
    }

    fn counter(business: BusinessId) -> Principal {
        member_of(business, &[&capabilities::CORRECTION_CREATE]).1
    }

    fn approver(business: BusinessId) -> Principal {
        member_of(business, &[&capabilities::CORRECTION_APPROVE]).1
    }

    #[test]
    fn record_reads_the_system_count_and_posts_nothing() {
        let (engine, business, dim) = stocked(12);
        let c = engine
            .corrections()
            .record(&counter(business), NewCorrection::new(dim, 9).with_reason("cycle count"))
            .unwrap();

        assert_eq!(c.system_count, 12);
        assert_eq!(c.difference, -3);
        assert_eq!(c.status, CorrectionStatus::Pending);
        assert!(c.number.starts_with("COR-"));
        assert_eq!(engine.ledger().snapshot(business, dim).unwrap().unwrap().qty_available, 12);
        assert_eq!(
            engine.corrections().list(business, Some(CorrectionStatus::Pending)).unwrap(),
            vec![c]
        );
    }

    #[test]
    fn matching_or_negative_counts_are_rejected() {
        let (engine, business, dim) = stocked(5);
        let same = engine
            .corrections()
            .record(&counter(business), NewCorrection::new(dim, 5))
            .unwrap_err();
        assert_eq!(same.kind(), ErrorKind::Validation);

        let negative = engine
            .corrections()
            .record(&counter(business), NewCorrection::new(dim, -1))
            .unwrap_err();
        assert_eq!(negative.kind(), ErrorKind::Validation);
    }

    #[test]
    fn approval_books_the_difference_exactly_once() {
        let (engine, business, dim) = stocked(10);
        let c = engine
            .corrections()
            .record(&counter(business), NewCorrection::new(dim, 13))
            .unwrap();

        let first = engine.corrections().approve(&approver(business), c.id).unwrap();
        assert!(first.newly_applied);
        let entry = first.entry.unwrap();
        assert_eq!(entry.entry_type, LedgerEntryType::Correction);
        assert_eq!(entry.quantity_delta, 3);
        assert_eq!(first.correction.linked_ledger_entry_id, Some(entry.id));

        let again = engine.corrections().approve(&approver(business), c.id).unwrap();
        assert!(!again.newly_applied);
        assert_eq!(again.entry.map(|e| e.id), Some(entry.id));

        assert_eq!(engine.ledger().snapshot(business, dim).unwrap().unwrap().qty_available, 13);
        assert_eq!(
            engine
                .ledger()
                .entries_for_reference(business, Reference::correction(c.id))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn recorder_cannot_approve_their_own_count() {
        let (engine, business, dim) = stocked(4);
        let (_, both) = member_of(
            business,
            &[&capabilities::CORRECTION_CREATE, &capabilities::CORRECTION_APPROVE],
        );
        let c = engine.corrections().record(&both, NewCorrection::new(dim, 2)).unwrap();

        let err = engine.corrections().approve(&both, c.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(
            engine.corrections().get(business, c.id).unwrap().status,
            CorrectionStatus::Pending
        );

        let supervisor = with_role(both, crate::config::DEFAULT_SOD_EXEMPT_ROLE);
        assert!(engine.corrections().approve(&supervisor, c.id).unwrap().newly_applied);
    }

    #[test]
    fn rejection_is_final_and_idempotent() {
        let (engine, business, dim) = stocked(4);
        let c = engine
            .corrections()
            .record(&counter(business), NewCorrection::new(dim, 1))
            .unwrap();

        let rejected = engine
            .corrections()
            .reject(&approver(business), c.id, Some("miscounted".into()))
            .unwrap();
        assert_eq!(rejected.status, CorrectionStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("miscounted"));

        let again = engine.corrections().reject(&approver(business), c.id, None).unwrap();
        assert_eq!(again.version, rejected.version);

        let err = engine.corrections().approve(&approver(business), c.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(engine.ledger().snapshot(business, dim).unwrap().unwrap().qty_available, 4);
    }

    #[test]
    fn approved_corrections_cannot_be_rejected() {
        let (engine, business, dim) = stocked(4);
        let c = engine
            .corrections()
            .record(&counter(business), NewCorrection::new(dim, 6))
            .unwrap();
        engine.corrections().approve(&approver(business), c.id).unwrap();

        let err = engine.corrections().reject(&approver(business), c.id, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn transfer_discrepancy_approval_posts_nothing() {
        let (engine, business, dim) = stocked(6);
        let store = engine.store();
        let mut uow = store.begin().unwrap();
        let (c, _) = Correction::record(
            CorrectionId::new(),
            business,
            "COR-DEST-20261019-0001".into(),
            NewCorrection::new(dim, 4),
            5,
            CorrectionSource::TransferDiscrepancy {
                transfer_id: stockflow_core::TransferId::new(),
            },
            UserId::new(),
            Utc::now(),
        )
        .unwrap();
        uow.put_correction(&c).unwrap();
        uow.commit().unwrap();

        let approved = engine.corrections().approve(&approver(business), c.id).unwrap();
        assert!(approved.newly_applied);
        assert!(approved.entry.is_none());
        assert_eq!(approved.correction.status, CorrectionStatus::Approved);
        assert_eq!(approved.correction.linked_ledger_entry_id, None);

        let again = engine.corrections().approve(&approver(business), c.id).unwrap();
        assert!(!again.newly_applied);
        assert_eq!(again.correction.version, approved.correction.version);

        let snapshot = engine.ledger().snapshot(business, dim).unwrap().unwrap();
        assert_eq!(snapshot.qty_available, 6);
        assert_eq!(snapshot.entry_count, 1);
    }

    #[test]
    fn unknown_correction_is_not_found() {
        let (engine, business, _) = stocked(1);
        let err = engine
            .corrections()
            .approve(&approver(business), CorrectionId::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
