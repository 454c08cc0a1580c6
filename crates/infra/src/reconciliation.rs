//! Read-only audits: snapshot against ledger replay, and transfer flags
//! against the entries booked for the transfer.
//!
//! Audits report; they never repair. `LedgerService::recompute_snapshot` is
//! the explicit operator fix.

use serde::Serialize;
use tracing::{error, info, instrument};

use stockflow_core::{BusinessId, TransferId};
use stockflow_inventory::{Dimension, LedgerEntryType, Reference, replay};

use crate::engine::InventoryEngine;
use crate::error::{EngineError, EngineResult};
use crate::store::{InventoryStore, UnitOfWork};

/// Outcome of comparing one snapshot with a replay of its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub dimension: Dimension,
    pub matches: bool,
    pub stored_qty: i64,
    pub replayed_qty: i64,
    pub stored_entry_count: u64,
    pub replayed_entry_count: u64,
    /// First entry whose `balance_after` or position disagrees with the replay.
    pub first_broken_position: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusinessAudit {
    pub checked: usize,
    pub drifted: Vec<ConsistencyReport>,
}

impl BusinessAudit {
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty()
    }
}

pub struct Reconciliation<'a, S> {
    engine: &'a InventoryEngine<S>,
}

impl<'a, S: InventoryStore> Reconciliation<'a, S> {
    pub(crate) fn new(engine: &'a InventoryEngine<S>) -> Self {
        Self { engine }
    }

    /// Replay a dimension's ledger and compare it with the stored snapshot.
    ///
    /// Reads under the snapshot lock so no append can land between the two
    /// reads.
    #[instrument(skip(self), fields(business_id = %business_id, dimension = %dimension), err)]
    pub fn verify_consistency(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> EngineResult<ConsistencyReport> {
        let (snapshot, entries) = self.engine.config.retry.run("reconciliation.verify", || {
            let mut uow = self.engine.store.begin()?;
            let snapshot = uow.lock_snapshot(business_id, dimension)?;
            let entries = uow.ledger_entries(business_id, dimension)?;
            Ok((snapshot, entries))
        })?;

        if snapshot.is_none() && entries.is_empty() {
            return Err(EngineError::not_found(format!("inventory for {dimension}")));
        }

        let replayed = replay(&entries);
        let (stored_qty, stored_entry_count) = snapshot
            .map(|s| (s.qty_available, s.entry_count))
            .unwrap_or((0, 0));

        let report = ConsistencyReport {
            dimension,
            matches: stored_qty == replayed.qty
                && stored_entry_count == replayed.entry_count
                && replayed.is_chain_intact(),
            stored_qty,
            replayed_qty: replayed.qty,
            stored_entry_count,
            replayed_entry_count: replayed.entry_count,
            first_broken_position: replayed.first_broken_position,
        };

        if !report.matches {
            error!(
                stored_qty,
                replayed_qty = report.replayed_qty,
                stored_entry_count,
                replayed_entry_count = report.replayed_entry_count,
                first_broken_position = ?report.first_broken_position,
                "snapshot drifted from ledger"
            );
        }
        Ok(report)
    }

    /// Like `verify_consistency`, but a mismatch is an error.
    pub fn ensure_consistent(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> EngineResult<()> {
        let report = self.verify_consistency(business_id, dimension)?;
        if report.matches {
            return Ok(());
        }
        Err(EngineError::consistency(
            format!("snapshot {dimension}"),
            format!(
                "stored {} over {} entries, ledger replays to {} over {}",
                report.stored_qty,
                report.stored_entry_count,
                report.replayed_qty,
                report.replayed_entry_count
            ),
        ))
    }

    /// Check every snapshot of a business.
    #[instrument(skip(self), fields(business_id = %business_id), err)]
    pub fn audit_business(&self, business_id: BusinessId) -> EngineResult<BusinessAudit> {
        let snapshots = self.engine.store.snapshots(business_id)?;
        let mut audit = BusinessAudit {
            checked: 0,
            drifted: Vec::new(),
        };

        for snapshot in snapshots {
            let report = self.verify_consistency(business_id, snapshot.dimension)?;
            audit.checked += 1;
            if !report.matches {
                audit.drifted.push(report);
            }
        }

        info!(checked = audit.checked, drifted = audit.drifted.len(), "business audit finished");
        Ok(audit)
    }

    /// Check that a transfer's ledger entries agree with its flags: one
    /// `transfer_out` per item once deducted, one reversal per item once
    /// reversed, and one `transfer_in` per counted item once received.
    #[instrument(skip(self), fields(business_id = %business_id, transfer_id = %transfer_id), err)]
    pub fn audit_transfer(
        &self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> EngineResult<()> {
        let transfer = self.engine.transfers().get(business_id, transfer_id)?;
        let entries = self
            .engine
            .store
            .entries_for_reference(business_id, Reference::transfer(transfer_id))?;

        let count = |ty: LedgerEntryType| entries.iter().filter(|e| e.entry_type == ty).count();
        let per_item = |flag: bool| if flag { transfer.items.len() } else { 0 };
        let counted = transfer
            .items
            .iter()
            .filter(|i| i.qty_verified.unwrap_or(0) > 0)
            .count();

        let checks = [
            (
                "transfer_out",
                count(LedgerEntryType::TransferOut),
                per_item(transfer.stock_deducted),
            ),
            (
                "transfer_out_reversal",
                count(LedgerEntryType::TransferOutReversal),
                per_item(transfer.deduction_reversed),
            ),
            (
                "transfer_in",
                count(LedgerEntryType::TransferIn),
                if transfer.is_received() { counted } else { 0 },
            ),
        ];

        let problems: Vec<String> = checks
            .iter()
            .filter(|(_, found, expected)| found != expected)
            .map(|(ty, found, expected)| format!("{found} {ty} entries, expected {expected}"))
            .collect();

        if problems.is_empty() {
            return Ok(());
        }

        error!(
            number = %transfer.number,
            status = %transfer.status,
            problems = ?problems,
            "transfer partially processed"
        );
        Err(EngineError::consistency(
            format!("transfer {}", transfer.number),
            problems.join("; "),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::{admin_of, dimension, engine, purchase, sale};
    use stockflow_core::{ExpectedVersion, LocationId, ProductVariantId};
    use stockflow_inventory::NewTransfer;

    #[test]
    fn untouched_ledger_is_consistent() {
        let engine = engine();
        let business = BusinessId::new();
        let dim = dimension();
        let admin = admin_of(business);
        engine.ledger().append(&admin, purchase(dim, 8)).unwrap();
        engine.ledger().append(&admin, sale(dim, 3)).unwrap();

        let report = engine.reconciliation().verify_consistency(business, dim).unwrap();
        assert!(report.matches);
        assert_eq!(report.replayed_qty, 5);
        assert_eq!(report.replayed_entry_count, 2);
        engine.reconciliation().ensure_consistent(business, dim).unwrap();

        let audit = engine.reconciliation().audit_business(business).unwrap();
        assert_eq!(audit.checked, 1);
        assert!(audit.is_clean());
    }

    #[test]
    fn tampered_snapshot_is_reported_not_repaired() {
        let engine = engine();
        let business = BusinessId::new();
        let dim = dimension();
        let admin = admin_of(business);
        engine.ledger().append(&admin, purchase(dim, 8)).unwrap();

        let mut uow = engine.store().begin().unwrap();
        let mut snapshot = uow.lock_snapshot(business, dim).unwrap().unwrap();
        snapshot.qty_available = 11;
        uow.put_snapshot(&snapshot).unwrap();
        uow.commit().unwrap();

        let report = engine.reconciliation().verify_consistency(business, dim).unwrap();
        assert!(!report.matches);
        assert_eq!(report.stored_qty, 11);
        assert_eq!(report.replayed_qty, 8);
        assert_eq!(report.first_broken_position, None);

        let err = engine.reconciliation().ensure_consistent(business, dim).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(engine.reconciliation().audit_business(business).unwrap().drifted.len(), 1);
        assert_eq!(engine.ledger().snapshot(business, dim).unwrap().unwrap().qty_available, 11);

        assert_eq!(engine.ledger().recompute_snapshot(&admin, dim).unwrap(), 8);
        assert!(engine.reconciliation().verify_consistency(business, dim).unwrap().matches);
    }

    #[test]
    fn unknown_dimension_is_not_found() {
        let engine = engine();
        let err = engine
            .reconciliation()
            .verify_consistency(BusinessId::new(), dimension())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn transfer_audit_flags_missing_entries() {
        let engine = engine();
        let business = BusinessId::new();
        let (from, to, variant) = (LocationId::new(), LocationId::new(), ProductVariantId::new());
        engine
            .ledger()
            .append(&admin_of(business), purchase(Dimension::new(variant, from), 10))
            .unwrap();

        let transfers = engine.transfers();
        let t = transfers
            .create(&admin_of(business), NewTransfer::new(from, to).with_item(variant, 4))
            .unwrap();
        transfers.submit(&admin_of(business), t.id, ExpectedVersion::Any).unwrap();
        transfers.approve(&admin_of(business), t.id, ExpectedVersion::Any).unwrap();
        transfers.send(&admin_of(business), t.id, ExpectedVersion::Any).unwrap();
        engine.reconciliation().audit_transfer(business, t.id).unwrap();

        // Flag claims a reversal that was never booked.
        let mut uow = engine.store().begin().unwrap();
        let mut tampered = uow.lock_transfer(business, t.id).unwrap().unwrap();
        tampered.deduction_reversed = true;
        uow.put_transfer(&tampered).unwrap();
        uow.commit().unwrap();

        let err = engine.reconciliation().audit_transfer(business, t.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.to_string().contains("transfer_out_reversal"));
    }
}
