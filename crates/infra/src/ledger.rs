//! Ledger service: the only path that writes ledger entries and snapshots.

use std::collections::VecDeque;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use stockflow_auth::Principal;
use stockflow_core::{BusinessId, LedgerEntryId, UserId};
use stockflow_inventory::{
    Dimension, HistoryRange, LedgerDraft, LedgerEntry, LedgerEvent, Reference, Snapshot, replay,
};

use crate::capabilities;
use crate::engine::InventoryEngine;
use crate::error::{EngineError, EngineResult};
use crate::notify::{self, Stream};
use crate::store::{InventoryStore, UnitOfWork};

pub(crate) const LEDGER_STREAM: &str = "inventory.ledger";

pub struct LedgerService<'a, S> {
    engine: &'a InventoryEngine<S>,
}

impl<'a, S: InventoryStore> LedgerService<'a, S> {
    pub(crate) fn new(engine: &'a InventoryEngine<S>) -> Self {
        Self { engine }
    }

    /// Append one entry in its own unit of work.
    ///
    /// Workflow-owned entry types (transfer and correction postings) are
    /// refused here; they are written by their workflows only.
    #[instrument(
        skip(self, principal, draft),
        fields(
            business_id = %principal.business_id(),
            dimension = %draft.dimension,
            entry_type = draft.entry_type.as_str(),
            delta = draft.quantity_delta
        ),
        err
    )]
    pub fn append(&self, principal: &Principal, draft: LedgerDraft) -> EngineResult<LedgerEntry> {
        let business_id = self.engine.authorize(principal, &capabilities::LEDGER_APPEND)?;
        if draft.entry_type.is_workflow_owned() {
            return Err(EngineError::Validation(format!(
                "{} entries are only written by their workflow",
                draft.entry_type.as_str()
            )));
        }

        let entry = self.engine.config.retry.run("ledger.append", || {
            let mut uow = self.engine.store.begin()?;
            let entry = self.append_in(&mut uow, business_id, &draft, principal.user_id)?;
            uow.commit()?;
            Ok(entry)
        })?;

        info!(
            entry_id = %entry.id,
            position = entry.position,
            balance_after = entry.balance_after,
            "ledger entry appended"
        );
        self.publish_appended(&entry);
        Ok(entry)
    }

    /// Post `draft` inside a caller-owned unit of work.
    ///
    /// Locks the dimension's snapshot (creating it at zero on first use),
    /// applies the business's stock policy and stages both the entry and the
    /// new snapshot. Nothing is visible until the caller commits.
    pub fn append_in<U>(
        &self,
        uow: &mut U,
        business_id: BusinessId,
        draft: &LedgerDraft,
        actor_id: UserId,
    ) -> EngineResult<LedgerEntry>
    where
        U: UnitOfWork + ?Sized,
    {
        let now = Utc::now();
        let current = uow
            .lock_snapshot(business_id, draft.dimension)?
            .unwrap_or_else(|| Snapshot::empty(business_id, draft.dimension, now));

        let (entry, next) = LedgerEntry::post(
            &current,
            draft,
            actor_id,
            LedgerEntryId::new(),
            now,
            self.engine.policy(business_id).stock_policy(),
        )?;

        uow.insert_ledger_entry(&entry)?;
        uow.put_snapshot(&next)?;

        debug!(
            dimension = %entry.dimension,
            entry_type = entry.entry_type.as_str(),
            delta = entry.quantity_delta,
            balance_after = entry.balance_after,
            "ledger entry staged"
        );
        Ok(entry)
    }

    /// Lazy, position-ordered history of a dimension.
    ///
    /// Pages are fetched on demand; each call starts a fresh read.
    pub fn history(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
        range: HistoryRange,
    ) -> LedgerHistory<'a, S> {
        LedgerHistory {
            store: &self.engine.store,
            business_id,
            dimension,
            range,
            page_size: self.engine.config.history_page_size.max(1),
            after_position: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn snapshot(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> EngineResult<Option<Snapshot>> {
        Ok(self.engine.store.snapshot(business_id, dimension)?)
    }

    pub fn snapshots(&self, business_id: BusinessId) -> EngineResult<Vec<Snapshot>> {
        Ok(self.engine.store.snapshots(business_id)?)
    }

    pub fn entries_for_reference(
        &self,
        business_id: BusinessId,
        reference: Reference,
    ) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self.engine.store.entries_for_reference(business_id, reference)?)
    }

    /// Rebuild a snapshot from its ledger and return the replayed quantity.
    ///
    /// Operator repair only; audits report drift and never call this.
    #[instrument(
        skip(self, principal),
        fields(business_id = %principal.business_id(), dimension = %dimension),
        err
    )]
    pub fn recompute_snapshot(
        &self,
        principal: &Principal,
        dimension: Dimension,
    ) -> EngineResult<i64> {
        let business_id = self.engine.authorize(principal, &capabilities::LEDGER_REPAIR)?;

        let (previous, rebuilt) = self.engine.config.retry.run("ledger.recompute_snapshot", || {
            let mut uow = self.engine.store.begin()?;
            let previous = uow.lock_snapshot(business_id, dimension)?;
            let entries = uow.ledger_entries(business_id, dimension)?;

            let Some(last_updated_at) = entries
                .last()
                .map(|e| e.created_at)
                .or_else(|| previous.as_ref().map(|s| s.last_updated_at))
            else {
                return Err(EngineError::not_found(format!("ledger for {dimension}")));
            };

            let replayed = replay(&entries);
            if let Some(position) = replayed.first_broken_position {
                warn!(position, "balance chain broken; snapshot follows the deltas");
            }

            let rebuilt = Snapshot {
                business_id,
                dimension,
                qty_available: replayed.qty,
                entry_count: replayed.entry_count,
                last_updated_at,
            };
            uow.put_snapshot(&rebuilt)?;
            uow.commit()?;
            Ok((previous, rebuilt))
        })?;

        match previous {
            Some(prev)
                if prev.qty_available != rebuilt.qty_available
                    || prev.entry_count != rebuilt.entry_count =>
            {
                warn!(
                    stored_qty = prev.qty_available,
                    replayed_qty = rebuilt.qty_available,
                    stored_entries = prev.entry_count,
                    replayed_entries = rebuilt.entry_count,
                    "snapshot rebuilt from ledger"
                );
            }
            _ => info!(qty = rebuilt.qty_available, "snapshot already matched ledger"),
        }
        Ok(rebuilt.qty_available)
    }

    pub(crate) fn publish_appended(&self, entry: &LedgerEntry) {
        notify::publish(
            self.engine.sink(),
            entry.business_id,
            Stream::new(entry.id, LEDGER_STREAM, entry.position),
            &LedgerEvent::EntryAppended(entry.clone()),
        );
    }
}

/// Iterator returned by [`LedgerService::history`].
pub struct LedgerHistory<'a, S> {
    store: &'a S,
    business_id: BusinessId,
    dimension: Dimension,
    range: HistoryRange,
    page_size: usize,
    after_position: u64,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

impl<S: InventoryStore> Iterator for LedgerHistory<'_, S> {
    type Item = EngineResult<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.ledger_page(
                self.business_id,
                self.dimension,
                self.range,
                self.after_position,
                self.page_size,
            ) {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
            }
        }

        let entry = self.buffer.pop_front()?;
        self.after_position = entry.position;
        Some(Ok(entry))
    }
}
