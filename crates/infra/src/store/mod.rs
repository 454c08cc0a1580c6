//! Storage boundary for the inventory engine.
//!
//! Reads outside a unit of work see committed state only. Everything that
//! writes goes through a [`UnitOfWork`]: rows are locked when read through it,
//! writes are staged, and nothing becomes visible until `commit`. Dropping a
//! unit of work without committing discards it and releases its locks.
//!
//! Sequence counters are the exception: `next_sequence` is a single atomic
//! upsert-increment that commits on its own, so a consumed number survives
//! even when the document it was meant for is never written.

pub mod in_memory;
mod lock_table;
pub mod postgres;

use std::sync::Arc;

use stockflow_core::{BusinessId, CorrectionId, TransferId};
use stockflow_inventory::{
    Correction, CorrectionStatus, Dimension, HistoryRange, LedgerEntry, Reference, SequenceScope,
    Snapshot, Transfer,
};

pub use in_memory::InMemoryInventoryStore;
pub use postgres::{PostgresInventoryStore, PostgresStoreOptions};

use crate::error::StoreError;

/// One atomic, isolated batch of inventory writes.
///
/// `lock_*` methods take a row lock held until commit/drop (re-entrant within
/// the same unit of work) and return the row as this unit of work sees it,
/// including its own staged writes. Lock waits are bounded; exceeding the
/// bound yields `StoreError::LockTimeout`.
pub trait UnitOfWork {
    /// Lock a dimension's snapshot row. `None` if the dimension was never posted to.
    fn lock_snapshot(
        &mut self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Insert or overwrite a snapshot. The dimension must be locked.
    fn put_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Append an immutable entry. The dimension must be locked.
    fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Full ledger of a dimension in position order, staged entries included.
    fn ledger_entries(
        &mut self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    fn lock_transfer(
        &mut self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> Result<Option<Transfer>, StoreError>;

    fn put_transfer(&mut self, transfer: &Transfer) -> Result<(), StoreError>;

    fn lock_correction(
        &mut self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> Result<Option<Correction>, StoreError>;

    fn put_correction(&mut self, correction: &Correction) -> Result<(), StoreError>;

    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Inventory persistence: committed reads plus units of work for writes.
pub trait InventoryStore: Send + Sync {
    type UnitOfWork<'a>: UnitOfWork
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::UnitOfWork<'_>, StoreError>;

    fn snapshot(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Every snapshot of a business, ordered by dimension.
    fn snapshots(&self, business_id: BusinessId) -> Result<Vec<Snapshot>, StoreError>;

    /// Up to `limit` entries with `position > after_position` inside `range`,
    /// in position order.
    fn ledger_page(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
        range: HistoryRange,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Entries booked against one document, ordered by creation time.
    fn entries_for_reference(
        &self,
        business_id: BusinessId,
        reference: Reference,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    fn transfer(
        &self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> Result<Option<Transfer>, StoreError>;

    fn correction(
        &self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> Result<Option<Correction>, StoreError>;

    /// Corrections of a business, newest first, optionally filtered by status.
    fn corrections(
        &self,
        business_id: BusinessId,
        status: Option<CorrectionStatus>,
    ) -> Result<Vec<Correction>, StoreError>;

    /// Atomically increment (or create at 1) the counter for `scope`.
    fn next_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError>;

    /// Last value handed out for `scope`, 0 if none.
    fn current_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError>;
}

impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore,
{
    type UnitOfWork<'a>
        = S::UnitOfWork<'a>
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::UnitOfWork<'_>, StoreError> {
        (**self).begin()
    }

    fn snapshot(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Option<Snapshot>, StoreError> {
        (**self).snapshot(business_id, dimension)
    }

    fn snapshots(&self, business_id: BusinessId) -> Result<Vec<Snapshot>, StoreError> {
        (**self).snapshots(business_id)
    }

    fn ledger_page(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
        range: HistoryRange,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).ledger_page(business_id, dimension, range, after_position, limit)
    }

    fn entries_for_reference(
        &self,
        business_id: BusinessId,
        reference: Reference,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).entries_for_reference(business_id, reference)
    }

    fn transfer(
        &self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> Result<Option<Transfer>, StoreError> {
        (**self).transfer(business_id, transfer_id)
    }

    fn correction(
        &self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> Result<Option<Correction>, StoreError> {
        (**self).correction(business_id, correction_id)
    }

    fn corrections(
        &self,
        business_id: BusinessId,
        status: Option<CorrectionStatus>,
    ) -> Result<Vec<Correction>, StoreError> {
        (**self).corrections(business_id, status)
    }

    fn next_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError> {
        (**self).next_sequence(scope)
    }

    fn current_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError> {
        (**self).current_sequence(scope)
    }
}
