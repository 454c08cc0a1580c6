use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use stockflow_core::{BusinessId, CorrectionId, TransferId};
use stockflow_inventory::{
    Correction, CorrectionStatus, Dimension, HistoryRange, LedgerEntry, Reference, SequenceScope,
    Snapshot, Transfer,
};

use super::lock_table::{LockKey, LockTable};
use super::{InventoryStore, UnitOfWork};
use crate::error::StoreError;

type DimKey = (BusinessId, Dimension);

#[derive(Debug, Default)]
struct State {
    entries: HashMap<DimKey, Vec<LedgerEntry>>,
    snapshots: BTreeMap<DimKey, Snapshot>,
    counters: HashMap<SequenceScope, u64>,
    transfers: HashMap<(BusinessId, TransferId), Transfer>,
    corrections: HashMap<(BusinessId, CorrectionId), Correction>,
}

/// In-memory inventory store.
///
/// Intended for tests/dev. Row locks and lock timeouts behave like the
/// Postgres store so contention paths can be exercised without a database.
#[derive(Debug)]
pub struct InMemoryInventoryStore {
    state: RwLock<State>,
    locks: LockTable,
    lock_timeout: Duration,
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(State::default()),
            locks: LockTable::default(),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }
}

/// Unit of work over [`InMemoryInventoryStore`]: held locks plus staged rows.
#[derive(Debug)]
pub struct InMemoryUnitOfWork<'a> {
    store: &'a InMemoryInventoryStore,
    held: Vec<LockKey>,
    snapshots: HashMap<DimKey, Snapshot>,
    entries: Vec<LedgerEntry>,
    transfers: HashMap<(BusinessId, TransferId), Transfer>,
    corrections: HashMap<(BusinessId, CorrectionId), Correction>,
}

impl InMemoryUnitOfWork<'_> {
    fn lock(&mut self, key: LockKey) -> Result<(), StoreError> {
        if self.held.contains(&key) {
            return Ok(());
        }
        self.store.locks.acquire(key, self.store.lock_timeout)?;
        self.held.push(key);
        Ok(())
    }

    fn ensure_locked(&self, key: LockKey) -> Result<(), StoreError> {
        if self.held.contains(&key) {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("write to {key} without holding its lock")))
        }
    }
}

impl Drop for InMemoryUnitOfWork<'_> {
    fn drop(&mut self) {
        self.store.locks.release(self.held.drain(..));
    }
}

impl UnitOfWork for InMemoryUnitOfWork<'_> {
    fn lock_snapshot(
        &mut self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Option<Snapshot>, StoreError> {
        self.lock(LockKey::Snapshot(business_id, dimension))?;
        if let Some(staged) = self.snapshots.get(&(business_id, dimension)) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.store.read()?.snapshots.get(&(business_id, dimension)).cloned())
    }

    fn put_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.ensure_locked(LockKey::Snapshot(snapshot.business_id, snapshot.dimension))?;
        self.snapshots
            .insert((snapshot.business_id, snapshot.dimension), snapshot.clone());
        Ok(())
    }

    fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.ensure_locked(LockKey::Snapshot(entry.business_id, entry.dimension))?;
        self.entries.push(entry.clone());
        Ok(())
    }

    fn ledger_entries(
        &mut self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut out = self
            .store
            .read()?
            .entries
            .get(&(business_id, dimension))
            .cloned()
            .unwrap_or_default();
        out.extend(
            self.entries
                .iter()
                .filter(|e| e.business_id == business_id && e.dimension == dimension)
                .cloned(),
        );
        Ok(out)
    }

    fn lock_transfer(
        &mut self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> Result<Option<Transfer>, StoreError> {
        self.lock(LockKey::Transfer(business_id, transfer_id))?;
        if let Some(staged) = self.transfers.get(&(business_id, transfer_id)) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.store.read()?.transfers.get(&(business_id, transfer_id)).cloned())
    }

    fn put_transfer(&mut self, transfer: &Transfer) -> Result<(), StoreError> {
        // New transfers are not visible to anyone else yet; take the lock now.
        self.lock(LockKey::Transfer(transfer.business_id, transfer.id))?;
        self.transfers
            .insert((transfer.business_id, transfer.id), transfer.clone());
        Ok(())
    }

    fn lock_correction(
        &mut self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> Result<Option<Correction>, StoreError> {
        self.lock(LockKey::Correction(business_id, correction_id))?;
        if let Some(staged) = self.corrections.get(&(business_id, correction_id)) {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .store
            .read()?
            .corrections
            .get(&(business_id, correction_id))
            .cloned())
    }

    fn put_correction(&mut self, correction: &Correction) -> Result<(), StoreError> {
        self.lock(LockKey::Correction(correction.business_id, correction.id))?;
        self.corrections
            .insert((correction.business_id, correction.id), correction.clone());
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let mut state = self.store.state.write().map_err(|_| StoreError::Poisoned)?;

        // Positions must continue each committed ledger exactly.
        let mut next_position: HashMap<DimKey, u64> = HashMap::new();
        for entry in &self.entries {
            let key = (entry.business_id, entry.dimension);
            let expected = next_position.entry(key).or_insert_with(|| {
                state.entries.get(&key).map(|v| v.len() as u64).unwrap_or(0) + 1
            });
            if entry.position != *expected {
                return Err(StoreError::Contention(format!(
                    "ledger position {} for {} already taken",
                    entry.position, entry.dimension
                )));
            }
            *expected += 1;
        }

        for entry in self.entries.drain(..) {
            state
                .entries
                .entry((entry.business_id, entry.dimension))
                .or_default()
                .push(entry);
        }
        state.snapshots.extend(self.snapshots.drain());
        state.transfers.extend(self.transfers.drain());
        state.corrections.extend(self.corrections.drain());

        Ok(())
    }
}

impl InventoryStore for InMemoryInventoryStore {
    type UnitOfWork<'a> = InMemoryUnitOfWork<'a>;

    fn begin(&self) -> Result<Self::UnitOfWork<'_>, StoreError> {
        Ok(InMemoryUnitOfWork {
            store: self,
            held: Vec::new(),
            snapshots: HashMap::new(),
            entries: Vec::new(),
            transfers: HashMap::new(),
            corrections: HashMap::new(),
        })
    }

    fn snapshot(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.read()?.snapshots.get(&(business_id, dimension)).cloned())
    }

    fn snapshots(&self, business_id: BusinessId) -> Result<Vec<Snapshot>, StoreError> {
        Ok(self
            .read()?
            .snapshots
            .iter()
            .filter(|((b, _), _)| *b == business_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn ledger_page(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
        range: HistoryRange,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.read()?;
        let Some(entries) = state.entries.get(&(business_id, dimension)) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter(|e| e.position > after_position && range.contains(e.created_at))
            .take(limit)
            .cloned()
            .collect())
    }

    fn entries_for_reference(
        &self,
        business_id: BusinessId,
        reference: Reference,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.read()?;
        let mut out: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|((b, _), _)| *b == business_id)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|e| e.reference == reference)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.created_at, a.dimension, a.position).cmp(&(b.created_at, b.dimension, b.position))
        });
        Ok(out)
    }

    fn transfer(
        &self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> Result<Option<Transfer>, StoreError> {
        Ok(self.read()?.transfers.get(&(business_id, transfer_id)).cloned())
    }

    fn correction(
        &self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> Result<Option<Correction>, StoreError> {
        Ok(self
            .read()?
            .corrections
            .get(&(business_id, correction_id))
            .cloned())
    }

    fn corrections(
        &self,
        business_id: BusinessId,
        status: Option<CorrectionStatus>,
    ) -> Result<Vec<Correction>, StoreError> {
        let state = self.read()?;
        let mut out: Vec<Correction> = state
            .corrections
            .values()
            .filter(|c| c.business_id == business_id && status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    fn next_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let counter = state.counters.entry(scope).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn current_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError> {
        Ok(self.read()?.counters.get(&scope).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockflow_core::{LedgerEntryId, LocationId, ProductVariantId, UserId};
    use stockflow_inventory::{LedgerDraft, LedgerEntryType, ReferenceType, StockPolicy};
    use uuid::Uuid;

    fn post(uow: &mut InMemoryUnitOfWork<'_>, business: BusinessId, dim: Dimension, qty: i64) {
        let current = uow
            .lock_snapshot(business, dim)
            .unwrap()
            .unwrap_or_else(|| Snapshot::empty(business, dim, Utc::now()));
        let draft = LedgerDraft::new(
            dim,
            LedgerEntryType::Adjustment,
            qty,
            Reference::new(ReferenceType::StockAdjustment, Uuid::now_v7()),
        );
        let (entry, next) = LedgerEntry::post(
            &current,
            &draft,
            UserId::new(),
            LedgerEntryId::new(),
            Utc::now(),
            StockPolicy::lenient(),
        )
        .unwrap();
        uow.insert_ledger_entry(&entry).unwrap();
        uow.put_snapshot(&next).unwrap();
    }

    fn dim() -> Dimension {
        Dimension::new(ProductVariantId::new(), LocationId::new())
    }

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let store = InMemoryInventoryStore::new();
        let business = BusinessId::new();
        let d = dim();

        let mut uow = store.begin().unwrap();
        post(&mut uow, business, d, 5);
        assert_eq!(uow.ledger_entries(business, d).unwrap().len(), 1);
        assert!(store.snapshot(business, d).unwrap().is_none());

        uow.commit().unwrap();
        assert_eq!(store.snapshot(business, d).unwrap().unwrap().qty_available, 5);
    }

    #[test]
    fn dropping_a_unit_of_work_discards_it_and_unlocks() {
        let store = InMemoryInventoryStore::new().with_lock_timeout(Duration::from_millis(10));
        let business = BusinessId::new();
        let d = dim();

        {
            let mut uow = store.begin().unwrap();
            post(&mut uow, business, d, 5);
        }

        assert!(store.snapshot(business, d).unwrap().is_none());
        let mut uow = store.begin().unwrap();
        assert!(uow.lock_snapshot(business, d).unwrap().is_none());
    }

    #[test]
    fn concurrent_lock_on_the_same_dimension_times_out() {
        let store = InMemoryInventoryStore::new().with_lock_timeout(Duration::from_millis(10));
        let business = BusinessId::new();
        let d = dim();

        let mut first = store.begin().unwrap();
        first.lock_snapshot(business, d).unwrap();

        let mut second = store.begin().unwrap();
        assert!(matches!(
            second.lock_snapshot(business, d),
            Err(StoreError::LockTimeout(_))
        ));
        // Re-entrant for the holder.
        assert!(first.lock_snapshot(business, d).is_ok());
    }

    #[test]
    fn writes_without_a_lock_are_refused() {
        let store = InMemoryInventoryStore::new();
        let business = BusinessId::new();
        let mut uow = store.begin().unwrap();
        let snapshot = Snapshot::empty(business, dim(), Utc::now());
        assert!(uow.put_snapshot(&snapshot).is_err());
    }

    #[test]
    fn sequence_counters_start_at_one_and_never_repeat() {
        let store = InMemoryInventoryStore::new();
        let scope = SequenceScope::new(
            BusinessId::new(),
            LocationId::new(),
            Utc::now().date_naive(),
        );
        assert_eq!(store.current_sequence(scope).unwrap(), 0);
        assert_eq!(store.next_sequence(scope).unwrap(), 1);
        assert_eq!(store.next_sequence(scope).unwrap(), 2);
        assert_eq!(store.current_sequence(scope).unwrap(), 2);
    }
}
