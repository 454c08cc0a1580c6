//! Transfer workflow: moves stock between two locations of one business.
//!
//! Each transition runs in one unit of work that locks the transfer row,
//! then every dimension the transition posts to (ascending), then posts the
//! ledger entries the transition implies:
//!
//! | Transition | Ledger effect |
//! |------------|---------------|
//! | `approved → sent` | `transfer_out` of `-qty_requested` per item at the source |
//! | `verifying → verified` | `transfer_in` of `+qty_verified` per counted item |
//! | `* → cancelled` after deduction | `transfer_out_reversal` of `+qty_requested` per item |
//!
//! Verification also opens a pending correction at the destination for every
//! line that arrived short or over.
//!
//! A failure on any item discards the whole unit of work, so a transfer is
//! never observed with only some of its items processed.

use chrono::Utc;
use tracing::{error, info, instrument};

use stockflow_auth::{Principal, SeparationOfDuties};
use stockflow_core::{
    Aggregate, BusinessId, CorrectionId, ExpectedVersion, ProductVariantId, TransferId, UserId,
};
use stockflow_inventory::{
    Correction, CorrectionEvent, CorrectionSource, DocumentKind, LedgerDraft, LedgerEntry,
    LedgerEntryType, NewCorrection, NewTransfer, Reference, Transfer, TransferAction,
    TransferCommand, TransferEvent, VerifiedCount,
};

use crate::capabilities;
use crate::correction::CORRECTION_STREAM;
use crate::engine::InventoryEngine;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::notify::{self, Stream};
use crate::store::{InventoryStore, UnitOfWork};

pub(crate) const TRANSFER_STREAM: &str = "inventory.transfer";

/// Result of one transfer transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub transfer: Transfer,
    /// Ledger entries posted by this transition, in posting order.
    pub entries: Vec<LedgerEntry>,
    /// Discrepancy corrections opened by this transition.
    pub corrections: Vec<Correction>,
}

struct Committed {
    outcome: TransferOutcome,
    events: Vec<TransferEvent>,
    correction_events: Vec<CorrectionEvent>,
}

pub struct TransferWorkflow<'a, S> {
    engine: &'a InventoryEngine<S>,
}

impl<'a, S: InventoryStore> TransferWorkflow<'a, S> {
    pub(crate) fn new(engine: &'a InventoryEngine<S>) -> Self {
        Self { engine }
    }

    /// Open a transfer in `draft` with a `TRF` number from the source location.
    #[instrument(
        skip(self, principal, new),
        fields(
            business_id = %principal.business_id(),
            from_location = %new.from_location,
            to_location = %new.to_location,
            items = new.items.len()
        ),
        err
    )]
    pub fn create(&self, principal: &Principal, new: NewTransfer) -> EngineResult<Transfer> {
        let business_id = self.engine.authorize(principal, &capabilities::TRANSFER_CREATE)?;
        new.validate()?;

        let now = Utc::now();
        let number = self
            .engine
            .sequences()
            .next_document_number(DocumentKind::Transfer, business_id, new.from_location, now)?
            .to_string();
        let (transfer, event) = Transfer::create(
            TransferId::new(),
            business_id,
            number,
            new,
            principal.user_id,
            now,
        )?;

        self.engine.config.retry.run("transfer.create", || {
            let mut uow = self.engine.store.begin()?;
            uow.put_transfer(&transfer)?;
            uow.commit()?;
            Ok(())
        })?;

        info!(transfer_id = %transfer.id, number = %transfer.number, "transfer created");
        notify::publish(
            self.engine.sink(),
            business_id,
            Stream::new(transfer.id, TRANSFER_STREAM, transfer.version),
            &event,
        );
        Ok(transfer)
    }

    pub fn get(&self, business_id: BusinessId, transfer_id: TransferId) -> EngineResult<Transfer> {
        self.engine
            .store
            .transfer(business_id, transfer_id)?
            .ok_or_else(|| EngineError::not_found(format!("transfer {transfer_id}")))
    }

    pub fn submit(
        &self,
        principal: &Principal,
        id: TransferId,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::Submit, expected)
    }

    pub fn approve(
        &self,
        principal: &Principal,
        id: TransferId,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::Approve, expected)
    }

    pub fn reject(
        &self,
        principal: &Principal,
        id: TransferId,
        reason: Option<String>,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::Reject { reason }, expected)
    }

    /// Deduct every item from the source location.
    pub fn send(
        &self,
        principal: &Principal,
        id: TransferId,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::Send, expected)
    }

    pub fn mark_arrived(
        &self,
        principal: &Principal,
        id: TransferId,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::MarkArrived, expected)
    }

    pub fn start_verification(
        &self,
        principal: &Principal,
        id: TransferId,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::StartVerification, expected)
    }

    /// Book the destination counts. Every item needs a count.
    pub fn verify(
        &self,
        principal: &Principal,
        id: TransferId,
        counts: Vec<VerifiedCount>,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::Verify { counts }, expected)
    }

    pub fn complete(
        &self,
        principal: &Principal,
        id: TransferId,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::Complete, expected)
    }

    /// Cancel; restores source stock if it was already deducted.
    pub fn cancel(
        &self,
        principal: &Principal,
        id: TransferId,
        reason: Option<String>,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        self.transition(principal, id, TransferAction::Cancel { reason }, expected)
    }

    /// Apply `action` to a transfer, with its ledger side effects, atomically.
    #[instrument(
        skip(self, principal, action),
        fields(
            business_id = %principal.business_id(),
            transfer_id = %transfer_id,
            action = action.name()
        ),
        err
    )]
    pub fn transition(
        &self,
        principal: &Principal,
        transfer_id: TransferId,
        action: TransferAction,
        expected: ExpectedVersion,
    ) -> EngineResult<TransferOutcome> {
        let business_id = self
            .engine
            .authorize(principal, capabilities::for_transfer_action(&action))?;

        let committed = self
            .engine
            .config
            .retry
            .run("transfer.transition", || {
                self.transition_once(principal, business_id, transfer_id, &action, expected)
            })
            .inspect_err(|err| {
                if err.kind() == ErrorKind::PartialFailure {
                    error!(
                        error = %err,
                        "transfer transition failed part way; unit of work discarded"
                    );
                }
            })?;

        let transfer = &committed.outcome.transfer;
        info!(
            number = %transfer.number,
            status = %transfer.status,
            entries = committed.outcome.entries.len(),
            corrections = committed.outcome.corrections.len(),
            "transfer transitioned"
        );
        self.publish(&committed);
        Ok(committed.outcome)
    }

    fn transition_once(
        &self,
        principal: &Principal,
        business_id: BusinessId,
        transfer_id: TransferId,
        action: &TransferAction,
        expected: ExpectedVersion,
    ) -> EngineResult<Committed> {
        let mut uow = self.engine.store.begin()?;
        let mut transfer = uow
            .lock_transfer(business_id, transfer_id)?
            .ok_or_else(|| EngineError::not_found(format!("transfer {transfer_id}")))?;
        expected.check(transfer.version)?;

        let policy = self.engine.policy(business_id);
        SeparationOfDuties::new(&policy.transfer_duties, &policy.sod_exempt_roles).check(
            principal,
            action.target_status(),
            |status| transfer.actor_of(status),
        )?;

        let now = Utc::now();
        let command = TransferCommand::new(principal.user_id, now, action.clone());
        let events = transfer.handle(&command)?;

        for dimension in transfer.dimensions_touched_by(&events) {
            uow.lock_snapshot(business_id, dimension)?;
        }

        let mut entries = Vec::new();
        let mut verified = false;
        for event in &events {
            let drafts = match event {
                TransferEvent::StockDeducted { .. } => Some((
                    "transfer.send",
                    self.item_drafts(&transfer, LedgerEntryType::TransferOut),
                )),
                TransferEvent::DeductionReversed { .. } => Some((
                    "transfer.cancel",
                    self.item_drafts(&transfer, LedgerEntryType::TransferOutReversal),
                )),
                TransferEvent::ItemsVerified { counts, .. } => {
                    verified = true;
                    Some(("transfer.verify", receipt_drafts(&transfer, counts)))
                }
                TransferEvent::Created { .. } | TransferEvent::StatusChanged { .. } => None,
            };
            if let Some((operation, drafts)) = drafts {
                self.post_all(
                    &mut uow,
                    business_id,
                    principal.user_id,
                    operation,
                    &drafts,
                    &mut entries,
                )?;
            }
            transfer.apply(event);
        }

        let mut corrections = Vec::new();
        let mut correction_events = Vec::new();
        if verified {
            for (correction, event) in self.open_discrepancies(&transfer, principal.user_id)? {
                uow.put_correction(&correction)?;
                corrections.push(correction);
                correction_events.push(event);
            }
        }

        uow.put_transfer(&transfer)?;
        uow.commit()?;

        Ok(Committed {
            outcome: TransferOutcome {
                transfer,
                entries,
                corrections,
            },
            events,
            correction_events,
        })
    }

    /// One draft per item at the source, signed for `entry_type`.
    fn item_drafts(&self, transfer: &Transfer, entry_type: LedgerEntryType) -> Vec<LedgerDraft> {
        let sign = if entry_type == LedgerEntryType::TransferOut { -1 } else { 1 };
        transfer
            .items
            .iter()
            .map(|item| {
                LedgerDraft::new(
                    transfer.source_dimension(item.variant_id),
                    entry_type,
                    sign * item.qty_requested,
                    Reference::transfer(transfer.id),
                )
            })
            .collect()
    }

    fn post_all<U: UnitOfWork + ?Sized>(
        &self,
        uow: &mut U,
        business_id: BusinessId,
        actor_id: UserId,
        operation: &'static str,
        drafts: &[LedgerDraft],
        out: &mut Vec<LedgerEntry>,
    ) -> EngineResult<()> {
        let ledger = self.engine.ledger();
        for (done, draft) in drafts.iter().enumerate() {
            let entry = ledger
                .append_in(uow, business_id, draft, actor_id)
                .map_err(|e| EngineError::partial(operation, done, drafts.len(), e))?;
            out.push(entry);
        }
        Ok(())
    }

    /// Pending corrections at the destination for every line that arrived
    /// short or over.
    fn open_discrepancies(
        &self,
        transfer: &Transfer,
        actor_id: UserId,
    ) -> EngineResult<Vec<(Correction, CorrectionEvent)>> {
        let lines: Vec<(ProductVariantId, i64, i64)> = transfer
            .discrepancies()
            .map(|(item, _)| (item.variant_id, item.qty_requested, item.qty_verified.unwrap_or(0)))
            .collect();

        let now = Utc::now();
        let mut out = Vec::with_capacity(lines.len());
        for (variant_id, requested, verified) in lines {
            let number = self
                .engine
                .sequences()
                .next_document_number(
                    DocumentKind::Correction,
                    transfer.business_id,
                    transfer.to_location,
                    now,
                )?
                .to_string();
            let new = NewCorrection::new(transfer.destination_dimension(variant_id), verified)
                .with_reason(format!(
                    "transfer {} verified {verified} of {requested}",
                    transfer.number
                ));
            out.push(Correction::record(
                CorrectionId::new(),
                transfer.business_id,
                number,
                new,
                requested,
                CorrectionSource::TransferDiscrepancy {
                    transfer_id: transfer.id,
                },
                actor_id,
                now,
            )?);
        }
        Ok(out)
    }

    fn publish(&self, committed: &Committed) {
        let transfer = &committed.outcome.transfer;
        let sink = self.engine.sink();
        let first_version = transfer.version + 1 - committed.events.len() as u64;

        for (i, event) in committed.events.iter().enumerate() {
            notify::publish(
                sink,
                transfer.business_id,
                Stream::new(transfer.id, TRANSFER_STREAM, first_version + i as u64),
                event,
            );
        }
        let ledger = self.engine.ledger();
        for entry in &committed.outcome.entries {
            ledger.publish_appended(entry);
        }
        let corrections = committed.outcome.corrections.iter();
        for (correction, event) in corrections.zip(&committed.correction_events) {
            notify::publish(
                sink,
                transfer.business_id,
                Stream::new(correction.id, CORRECTION_STREAM, correction.version),
                event,
            );
        }
    }
}

/// `transfer_in` drafts for every line counted above zero.
fn receipt_drafts(transfer: &Transfer, counts: &[VerifiedCount]) -> Vec<LedgerDraft> {
    counts
        .iter()
        .filter(|c| c.qty_verified > 0)
        .map(|c| {
            LedgerDraft::new(
                transfer.destination_dimension(c.variant_id),
                LedgerEntryType::TransferIn,
                c.qty_verified,
                Reference::transfer(transfer.id),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusinessPolicy, EngineConfig};
    use crate::test_support::{admin_of, engine, engine_with, member_of, purchase, with_role};
    use stockflow_core::LocationId;
    use stockflow_inventory::{CorrectionStatus, Dimension, TransferStatus};

    struct Fixture {
        engine: InventoryEngine<crate::store::InMemoryInventoryStore>,
        business: BusinessId,
        from: LocationId,
        to: LocationId,
        variant: ProductVariantId,
    }

    impl Fixture {
        fn new(
            engine: InventoryEngine<crate::store::InMemoryInventoryStore>,
            business: BusinessId,
            stock: i64,
        ) -> Self {
            let f = Self {
                engine,
                business,
                from: LocationId::new(),
                to: LocationId::new(),
                variant: ProductVariantId::new(),
            };
            if stock > 0 {
                let (_, clerk) = member_of(business, &[&capabilities::LEDGER_APPEND]);
                f.engine.ledger().append(&clerk, purchase(f.source(), stock)).unwrap();
            }
            f
        }

        fn source(&self) -> Dimension {
            Dimension::new(self.variant, self.from)
        }

        fn destination(&self) -> Dimension {
            Dimension::new(self.variant, self.to)
        }

        fn qty(&self, dim: Dimension) -> i64 {
            self.engine
                .ledger()
                .snapshot(self.business, dim)
                .unwrap()
                .map(|s| s.qty_available)
                .unwrap_or(0)
        }

        fn draft(&self, qty: i64) -> Transfer {
            let creator = admin_of(self.business);
            self.engine
                .transfers()
                .create(&creator, NewTransfer::new(self.from, self.to).with_item(self.variant, qty))
                .unwrap()
        }

        /// Created, submitted and approved by different people.
        fn approved(&self, qty: i64) -> Transfer {
            let t = self.draft(qty);
            let wf = self.engine.transfers();
            wf.submit(&admin_of(self.business), t.id, ExpectedVersion::Any).unwrap();
            wf.approve(&admin_of(self.business), t.id, ExpectedVersion::Any)
                .unwrap()
                .transfer
        }
    }

    fn any() -> ExpectedVersion {
        ExpectedVersion::Any
    }

    #[test]
    fn create_assigns_a_number_and_validates() {
        let f = Fixture::new(engine(), BusinessId::new(), 0);
        let t = f.draft(5);
        assert!(t.number.starts_with("TRF-"));
        assert_eq!(t.status, TransferStatus::Draft);
        assert_eq!(f.engine.transfers().get(f.business, t.id).unwrap(), t);

        let same_place = NewTransfer::new(f.from, f.from).with_item(f.variant, 1);
        let err = f
            .engine
            .transfers()
            .create(&admin_of(f.business), same_place)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn send_deducts_every_item_from_the_source() {
        let f = Fixture::new(engine(), BusinessId::new(), 50);
        let t = f.approved(20);

        let out = f.engine.transfers().send(&admin_of(f.business), t.id, any()).unwrap();
        assert!(out.transfer.stock_deducted);
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].entry_type, LedgerEntryType::TransferOut);
        assert_eq!(out.entries[0].quantity_delta, -20);
        assert_eq!(f.qty(f.source()), 30);
    }

    #[test]
    fn cancel_before_send_has_no_ledger_effect() {
        let f = Fixture::new(engine(), BusinessId::new(), 10);
        let t = f.approved(4);

        let out = f
            .engine
            .transfers()
            .cancel(&admin_of(f.business), t.id, Some("not needed".into()), any())
            .unwrap();
        assert_eq!(out.transfer.status, TransferStatus::Cancelled);
        assert!(out.entries.is_empty());
        assert_eq!(f.qty(f.source()), 10);
    }

    #[test]
    fn cancel_after_send_restores_the_source_exactly() {
        let f = Fixture::new(engine(), BusinessId::new(), 10);
        let t = f.approved(4);
        let wf = f.engine.transfers();
        wf.send(&admin_of(f.business), t.id, any()).unwrap();
        wf.mark_arrived(&admin_of(f.business), t.id, any()).unwrap();
        assert_eq!(f.qty(f.source()), 6);

        let out = wf.cancel(&admin_of(f.business), t.id, None, any()).unwrap();
        assert_eq!(f.qty(f.source()), 10);
        assert!(out.transfer.stock_deducted);
        assert!(out.transfer.deduction_reversed);
        assert_eq!(out.entries[0].entry_type, LedgerEntryType::TransferOutReversal);

        let err = wf.cancel(&admin_of(f.business), t.id, None, any()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn creator_cannot_approve_without_exemption() {
        let f = Fixture::new(engine(), BusinessId::new(), 0);
        let creator = admin_of(f.business);
        let t = f
            .engine
            .transfers()
            .create(&creator, NewTransfer::new(f.from, f.to).with_item(f.variant, 1))
            .unwrap();
        f.engine.transfers().submit(&creator, t.id, any()).unwrap();

        let err = f.engine.transfers().approve(&creator, t.id, any()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let supervisor = with_role(creator, crate::config::DEFAULT_SOD_EXEMPT_ROLE);
        let out = f.engine.transfers().approve(&supervisor, t.id, any()).unwrap();
        assert_eq!(out.transfer.status, TransferStatus::Approved);
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let f = Fixture::new(engine(), BusinessId::new(), 0);
        let t = f.draft(1);
        let err = f
            .engine
            .transfers()
            .submit(&admin_of(f.business), t.id, ExpectedVersion::Exact(t.version + 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        f.engine
            .transfers()
            .submit(&admin_of(f.business), t.id, ExpectedVersion::Exact(t.version))
            .unwrap();
    }

    #[test]
    fn approval_requires_submission() {
        let f = Fixture::new(engine(), BusinessId::new(), 0);
        let t = f.draft(1);
        let err = f
            .engine
            .transfers()
            .approve(&admin_of(f.business), t.id, any())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn missing_capability_is_denied_before_anything_is_read() {
        let f = Fixture::new(engine(), BusinessId::new(), 0);
        let (_, receiver) = member_of(f.business, &[&capabilities::TRANSFER_RECEIVE]);
        let err = f
            .engine
            .transfers()
            .send(&receiver, TransferId::new(), any())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = f
            .engine
            .transfers()
            .mark_arrived(&receiver, TransferId::new(), any())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn verify_books_counts_and_opens_discrepancy_corrections() {
        let f = Fixture::new(engine(), BusinessId::new(), 40);
        let other = ProductVariantId::new();
        let (_, clerk) = member_of(f.business, &[&capabilities::LEDGER_APPEND]);
        f.engine
            .ledger()
            .append(&clerk, purchase(Dimension::new(other, f.from), 5))
            .unwrap();

        let creator = admin_of(f.business);
        let t = f
            .engine
            .transfers()
            .create(
                &creator,
                NewTransfer::new(f.from, f.to)
                    .with_item(f.variant, 10)
                    .with_item(other, 5),
            )
            .unwrap();
        let wf = f.engine.transfers();
        let actor = admin_of(f.business);
        wf.submit(&actor, t.id, any()).unwrap();
        wf.approve(&actor, t.id, any()).unwrap();
        wf.send(&actor, t.id, any()).unwrap();
        wf.mark_arrived(&actor, t.id, any()).unwrap();
        wf.start_verification(&actor, t.id, any()).unwrap();

        let incomplete = wf
            .verify(&actor, t.id, vec![VerifiedCount::new(f.variant, 10)], any())
            .unwrap_err();
        assert_eq!(incomplete.kind(), ErrorKind::Validation);

        let out = wf
            .verify(
                &actor,
                t.id,
                vec![VerifiedCount::new(f.variant, 10), VerifiedCount::new(other, 0)],
                any(),
            )
            .unwrap();

        // Zero-count lines post nothing; their shortfall becomes a correction.
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].quantity_delta, 10);
        assert_eq!(out.corrections.len(), 1);
        let c = &out.corrections[0];
        assert_eq!(c.dimension, Dimension::new(other, f.to));
        assert_eq!(c.difference, -5);
        assert_eq!(c.status, CorrectionStatus::Pending);
        assert!(c.number.starts_with("COR-"));
        assert_eq!(f.qty(f.destination()), 10);

        let sod = wf.complete(&actor, t.id, any()).unwrap_err();
        assert_eq!(sod.kind(), ErrorKind::PermissionDenied);
        let done = wf.complete(&admin_of(f.business), t.id, any()).unwrap();
        assert_eq!(done.transfer.status, TransferStatus::Completed);
        assert!(done.transfer.has_passed(TransferStatus::Sent));
        assert!(done.transfer.has_passed(TransferStatus::Verified));
        assert!(done.transfer.is_retired());
    }

    #[test]
    fn strict_deduction_failure_leaves_no_trace() {
        let business = BusinessId::new();
        let engine = engine_with(
            EngineConfig::default().with_business_policy(
                business,
                BusinessPolicy::default().with_strict_non_negative(true),
            ),
        );
        let f = Fixture::new(engine, business, 10);
        let short = ProductVariantId::new();

        let actor = admin_of(business);
        let t = f
            .engine
            .transfers()
            .create(
                &actor,
                NewTransfer::new(f.from, f.to)
                    .with_item(f.variant, 5)
                    .with_item(short, 3),
            )
            .unwrap();
        let wf = f.engine.transfers();
        wf.submit(&actor, t.id, any()).unwrap();
        wf.approve(&admin_of(business), t.id, any()).unwrap();

        let err = wf.send(&admin_of(business), t.id, any()).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            EngineError::InsufficientStock { .. }
        ));

        let reloaded = wf.get(business, t.id).unwrap();
        assert_eq!(reloaded.status, TransferStatus::Approved);
        assert!(!reloaded.stock_deducted);
        assert_eq!(f.qty(f.source()), 10);
        assert!(f
            .engine
            .ledger()
            .entries_for_reference(business, Reference::transfer(t.id))
            .unwrap()
            .is_empty());
    }
}
