//! Postgres-backed inventory store.
//!
//! ## Locking
//!
//! Every unit of work is one transaction with `lock_timeout` set locally.
//! Rows are locked with `SELECT ... FOR UPDATE`. A dimension that has no
//! snapshot row yet is serialized with a transaction-scoped advisory lock on
//! its key, so two first postings cannot both start from zero.
//!
//! ## Error Mapping
//!
//! | SQLSTATE | Meaning | StoreError |
//! |----------|---------|------------|
//! | `55P03` | lock_not_available | `LockTimeout` |
//! | `40P01` | deadlock_detected | `LockTimeout` |
//! | `23505` | unique_violation | `Contention` |
//! | `40001` | serialization_failure | `Contention` |
//! | other | | `Backend` |
//!
//! ## Runtime
//!
//! The storage traits are synchronous. The store owns a tokio runtime and
//! blocks on it, so its methods must not be called from inside an async task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use stockflow_core::{
    BusinessId, CorrectionId, LedgerEntryId, LocationId, ProductVariantId, TransferId, UserId,
};
use stockflow_inventory::{
    Correction, CorrectionStatus, Dimension, HistoryRange, LedgerEntry, Reference, SequenceScope,
    Snapshot, Transfer, TransferItem, TransitionRecord,
};

use super::{InventoryStore, UnitOfWork};
use crate::error::StoreError;

const MIGRATION: &str = include_str!("../../migrations/0001_inventory_ledger.sql");

/// Connection settings for [`PostgresInventoryStore`].
#[derive(Debug, Clone)]
pub struct PostgresStoreOptions {
    pub database_url: String,
    pub max_connections: u32,
    pub lock_timeout: Duration,
}

impl PostgresStoreOptions {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            lock_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// `DATABASE_URL` (required), `STOCKFLOW_DB_MAX_CONNECTIONS` and
    /// `STOCKFLOW_LOCK_TIMEOUT_MS` (optional).
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;

        let url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let mut options = Self::new(url);

        if let Ok(raw) = std::env::var("STOCKFLOW_DB_MAX_CONNECTIONS") {
            let max: u32 = raw
                .parse()
                .with_context(|| format!("invalid STOCKFLOW_DB_MAX_CONNECTIONS '{raw}'"))?;
            options = options.with_max_connections(max);
        }
        if let Ok(raw) = std::env::var("STOCKFLOW_LOCK_TIMEOUT_MS") {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("invalid STOCKFLOW_LOCK_TIMEOUT_MS '{raw}'"))?;
            options = options.with_lock_timeout(Duration::from_millis(ms));
        }

        Ok(options)
    }
}

/// Inventory store on PostgreSQL.
///
/// Every query filters on `business_id`; nothing crosses businesses.
#[derive(Debug)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    runtime: Runtime,
    lock_timeout: Duration,
}

impl PostgresInventoryStore {
    pub fn connect(options: &PostgresStoreOptions) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("stockflow-pg")
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(options.max_connections)
                    .connect(&options.database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime,
            lock_timeout: options.lock_timeout,
        })
    }

    /// Create tables, indexes and the append-only trigger if missing.
    #[instrument(skip(self), err)]
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.block_on(sqlx::raw_sql(MIGRATION).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    fn ensure_sync_context() -> Result<(), StoreError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(StoreError::Backend(
                "PostgresInventoryStore called from inside an async runtime".to_string(),
            ));
        }
        Ok(())
    }
}

/// One Postgres transaction.
pub struct PgUnitOfWork<'a> {
    store: &'a PostgresInventoryStore,
    tx: Option<Transaction<'static, Postgres>>,
}

impl std::fmt::Debug for PgUnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnitOfWork")
            .field("open", &self.tx.is_some())
            .finish()
    }
}

impl Drop for PgUnitOfWork<'_> {
    fn drop(&mut self) {
        // Rolling back returns the connection to the pool via a spawned task.
        if let Some(tx) = self.tx.take() {
            let _guard = self.store.runtime.enter();
            drop(tx);
        }
    }
}

impl PgUnitOfWork<'_> {
    fn parts(
        &mut self,
    ) -> Result<(&PostgresInventoryStore, &mut Transaction<'static, Postgres>), StoreError> {
        let store = self.store;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("unit of work already finished".to_string()))?;
        Ok((store, tx))
    }

    fn load_transfer_children(&mut self, row: TransferRow) -> Result<Transfer, StoreError> {
        let (store, tx) = self.parts()?;
        let (items, transitions) = store.block_on(async {
            let items = sqlx::query(SELECT_TRANSFER_ITEMS)
                .bind(row.id)
                .fetch_all(&mut **tx)
                .await?;
            let transitions = sqlx::query(SELECT_TRANSFER_TRANSITIONS)
                .bind(row.id)
                .fetch_all(&mut **tx)
                .await?;
            Ok::<_, sqlx::Error>((items, transitions))
        })
        .map_err(|e| map_sqlx_error("load_transfer", e))?;
        row.into_transfer(&items, &transitions)
    }
}

impl UnitOfWork for PgUnitOfWork<'_> {
    #[instrument(
        skip(self),
        fields(business_id = %business_id, dimension = %dimension, found = tracing::field::Empty),
        err
    )]
    fn lock_snapshot(
        &mut self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Option<Snapshot>, StoreError> {
        let (store, tx) = self.parts()?;
        let row = store
            .block_on(async {
                let select = || {
                    sqlx::query(
                        r#"
                        SELECT business_id, location_id, variant_id, qty_available, entry_count,
                               last_updated_at
                        FROM inventory_snapshots
                        WHERE business_id = $1 AND location_id = $2 AND variant_id = $3
                        FOR UPDATE
                        "#,
                    )
                    .bind(*business_id.as_uuid())
                    .bind(*dimension.location_id.as_uuid())
                    .bind(*dimension.variant_id.as_uuid())
                };

                if let Some(row) = select().fetch_optional(&mut **tx).await? {
                    return Ok(Some(row));
                }

                // No row to lock yet: serialize first postings on the key instead.
                sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                    .bind(format!(
                        "inventory_snapshots:{business_id}:{}:{}",
                        dimension.location_id, dimension.variant_id
                    ))
                    .execute(&mut **tx)
                    .await?;

                select().fetch_optional(&mut **tx).await
            })
            .map_err(|e| map_sqlx_error("lock_snapshot", e))?;

        Span::current().record("found", row.is_some());
        row.as_ref().map(decode_snapshot).transpose()
    }

    fn put_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let (store, tx) = self.parts()?;
        store
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO inventory_snapshots
                        (business_id, location_id, variant_id, qty_available, entry_count,
                         last_updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (business_id, location_id, variant_id)
                    DO UPDATE SET
                        qty_available = EXCLUDED.qty_available,
                        entry_count = EXCLUDED.entry_count,
                        last_updated_at = EXCLUDED.last_updated_at
                    "#,
                )
                .bind(*snapshot.business_id.as_uuid())
                .bind(*snapshot.dimension.location_id.as_uuid())
                .bind(*snapshot.dimension.variant_id.as_uuid())
                .bind(snapshot.qty_available)
                .bind(snapshot.entry_count as i64)
                .bind(snapshot.last_updated_at)
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("put_snapshot", e))?;
        Ok(())
    }

    fn insert_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let (store, tx) = self.parts()?;
        store
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO inventory_ledger_entries (
                        id, business_id, location_id, variant_id, entry_type, quantity_delta,
                        balance_after, position, reference_type, reference_id, unit_cost,
                        actor_id, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    "#,
                )
                .bind(*entry.id.as_uuid())
                .bind(*entry.business_id.as_uuid())
                .bind(*entry.dimension.location_id.as_uuid())
                .bind(*entry.dimension.variant_id.as_uuid())
                .bind(entry.entry_type.as_str())
                .bind(entry.quantity_delta)
                .bind(entry.balance_after)
                .bind(entry.position as i64)
                .bind(entry.reference.reference_type.as_str())
                .bind(entry.reference.reference_id)
                .bind(entry.unit_cost.map(|c| c as i64))
                .bind(*entry.actor_id.as_uuid())
                .bind(entry.created_at)
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("insert_ledger_entry", e))?;
        Ok(())
    }

    fn ledger_entries(
        &mut self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let (store, tx) = self.parts()?;
        let rows = store
            .block_on(
                sqlx::query(&format!(
                    "{SELECT_LEDGER_ENTRIES} WHERE business_id = $1 AND location_id = $2 \
                     AND variant_id = $3 ORDER BY position ASC"
                ))
                .bind(*business_id.as_uuid())
                .bind(*dimension.location_id.as_uuid())
                .bind(*dimension.variant_id.as_uuid())
                .fetch_all(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("ledger_entries", e))?;
        decode_entries(&rows)
    }

    #[instrument(skip(self), fields(business_id = %business_id, transfer_id = %transfer_id), err)]
    fn lock_transfer(
        &mut self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> Result<Option<Transfer>, StoreError> {
        let sql = format!("{SELECT_TRANSFERS} WHERE business_id = $1 AND id = $2 FOR UPDATE");
        let (store, tx) = self.parts()?;
        let row = store
            .block_on(
                sqlx::query(&sql)
                    .bind(*business_id.as_uuid())
                    .bind(*transfer_id.as_uuid())
                    .fetch_optional(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("lock_transfer", e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let row = decode::<TransferRow>("inventory_transfers", &row)?;
                self.load_transfer_children(row).map(Some)
            }
        }
    }

    fn put_transfer(&mut self, transfer: &Transfer) -> Result<(), StoreError> {
        let (store, tx) = self.parts()?;
        store
            .block_on(async {
                sqlx::query(
                    r#"
                    INSERT INTO inventory_transfers (
                        id, business_id, number, from_location, to_location, status,
                        stock_deducted, deduction_reversed, note, status_reason, version
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (id) DO UPDATE SET
                        status = EXCLUDED.status,
                        stock_deducted = EXCLUDED.stock_deducted,
                        deduction_reversed = EXCLUDED.deduction_reversed,
                        status_reason = EXCLUDED.status_reason,
                        version = EXCLUDED.version
                    "#,
                )
                .bind(*transfer.id.as_uuid())
                .bind(*transfer.business_id.as_uuid())
                .bind(&transfer.number)
                .bind(*transfer.from_location.as_uuid())
                .bind(*transfer.to_location.as_uuid())
                .bind(transfer.status.as_str())
                .bind(transfer.stock_deducted)
                .bind(transfer.deduction_reversed)
                .bind(transfer.note.as_deref())
                .bind(transfer.status_reason.as_deref())
                .bind(transfer.version as i64)
                .execute(&mut **tx)
                .await?;

                for (line_no, item) in transfer.items.iter().enumerate() {
                    sqlx::query(
                        r#"
                        INSERT INTO inventory_transfer_items
                            (transfer_id, variant_id, line_no, qty_requested, qty_verified)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (transfer_id, variant_id)
                        DO UPDATE SET qty_verified = EXCLUDED.qty_verified
                        "#,
                    )
                    .bind(*transfer.id.as_uuid())
                    .bind(*item.variant_id.as_uuid())
                    .bind(line_no as i32)
                    .bind(item.qty_requested)
                    .bind(item.qty_verified)
                    .execute(&mut **tx)
                    .await?;
                }

                for (seq, transition) in transfer.transitions.iter().enumerate() {
                    sqlx::query(
                        r#"
                        INSERT INTO inventory_transfer_transitions
                            (transfer_id, seq, status, actor_id, at)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (transfer_id, seq) DO NOTHING
                        "#,
                    )
                    .bind(*transfer.id.as_uuid())
                    .bind(seq as i32)
                    .bind(transition.status.as_str())
                    .bind(*transition.actor_id.as_uuid())
                    .bind(transition.at)
                    .execute(&mut **tx)
                    .await?;
                }

                Ok::<_, sqlx::Error>(())
            })
            .map_err(|e| map_sqlx_error("put_transfer", e))
    }

    #[instrument(
        skip(self),
        fields(business_id = %business_id, correction_id = %correction_id),
        err
    )]
    fn lock_correction(
        &mut self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> Result<Option<Correction>, StoreError> {
        let sql = format!("{SELECT_CORRECTIONS} WHERE business_id = $1 AND id = $2 FOR UPDATE");
        let (store, tx) = self.parts()?;
        let row = store
            .block_on(
                sqlx::query(&sql)
                    .bind(*business_id.as_uuid())
                    .bind(*correction_id.as_uuid())
                    .fetch_optional(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("lock_correction", e))?;

        row.as_ref().map(decode_correction).transpose()
    }

    fn put_correction(&mut self, correction: &Correction) -> Result<(), StoreError> {
        let source = serde_json::to_value(correction.source)
            .map_err(|e| StoreError::corrupt("inventory_corrections", e.to_string()))?;
        let (store, tx) = self.parts()?;
        store
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO inventory_corrections (
                        id, business_id, number, location_id, variant_id, system_count,
                        physical_count, difference, status, source, reason, created_by,
                        created_at, decided_by, decided_at, linked_ledger_entry_id, version
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                            $10, $11, $12, $13, $14, $15, $16, $17)
                    ON CONFLICT (id) DO UPDATE SET
                        status = EXCLUDED.status,
                        reason = EXCLUDED.reason,
                        decided_by = EXCLUDED.decided_by,
                        decided_at = EXCLUDED.decided_at,
                        linked_ledger_entry_id = EXCLUDED.linked_ledger_entry_id,
                        version = EXCLUDED.version
                    "#,
                )
                .bind(*correction.id.as_uuid())
                .bind(*correction.business_id.as_uuid())
                .bind(&correction.number)
                .bind(*correction.dimension.location_id.as_uuid())
                .bind(*correction.dimension.variant_id.as_uuid())
                .bind(correction.system_count)
                .bind(correction.physical_count)
                .bind(correction.difference)
                .bind(correction.status.as_str())
                .bind(source)
                .bind(correction.reason.as_deref())
                .bind(*correction.created_by.as_uuid())
                .bind(correction.created_at)
                .bind(correction.decided_by.map(Uuid::from))
                .bind(correction.decided_at)
                .bind(correction.linked_ledger_entry_id.map(Uuid::from))
                .bind(correction.version as i64)
                .execute(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("put_correction", e))?;
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Backend("unit of work already finished".to_string()))?;
        self.store
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

impl InventoryStore for PostgresInventoryStore {
    type UnitOfWork<'a> = PgUnitOfWork<'a>;

    fn begin(&self) -> Result<Self::UnitOfWork<'_>, StoreError> {
        Self::ensure_sync_context()?;

        let timeout = format!("{}ms", self.lock_timeout.as_millis().max(1));
        let tx = self
            .block_on(async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                    .bind(&timeout)
                    .execute(&mut *tx)
                    .await?;
                Ok::<_, sqlx::Error>(tx)
            })
            .map_err(|e| map_sqlx_error("begin", e))?;

        debug!(lock_timeout = %timeout, "unit of work started");
        Ok(PgUnitOfWork {
            store: self,
            tx: Some(tx),
        })
    }

    fn snapshot(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
    ) -> Result<Option<Snapshot>, StoreError> {
        Self::ensure_sync_context()?;
        let row = self
            .block_on(
                sqlx::query(
                    r#"
                    SELECT business_id, location_id, variant_id, qty_available, entry_count,
                           last_updated_at
                    FROM inventory_snapshots
                    WHERE business_id = $1 AND location_id = $2 AND variant_id = $3
                    "#,
                )
                .bind(*business_id.as_uuid())
                .bind(*dimension.location_id.as_uuid())
                .bind(*dimension.variant_id.as_uuid())
                .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("snapshot", e))?;
        row.as_ref().map(decode_snapshot).transpose()
    }

    fn snapshots(&self, business_id: BusinessId) -> Result<Vec<Snapshot>, StoreError> {
        Self::ensure_sync_context()?;
        let rows = self
            .block_on(
                sqlx::query(
                    r#"
                    SELECT business_id, location_id, variant_id, qty_available, entry_count,
                           last_updated_at
                    FROM inventory_snapshots
                    WHERE business_id = $1
                    ORDER BY location_id, variant_id
                    "#,
                )
                .bind(*business_id.as_uuid())
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("snapshots", e))?;
        rows.iter().map(decode_snapshot).collect()
    }

    #[instrument(
        skip(self, range),
        fields(business_id = %business_id, dimension = %dimension),
        err
    )]
    fn ledger_page(
        &self,
        business_id: BusinessId,
        dimension: Dimension,
        range: HistoryRange,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Self::ensure_sync_context()?;
        let rows = self
            .block_on(
                sqlx::query(&format!(
                    r#"
                    {SELECT_LEDGER_ENTRIES}
                    WHERE business_id = $1 AND location_id = $2 AND variant_id = $3
                        AND position > $4
                        AND ($5::timestamptz IS NULL OR created_at >= $5)
                        AND ($6::timestamptz IS NULL OR created_at < $6)
                    ORDER BY position ASC
                    LIMIT $7
                    "#
                ))
                .bind(*business_id.as_uuid())
                .bind(*dimension.location_id.as_uuid())
                .bind(*dimension.variant_id.as_uuid())
                .bind(after_position as i64)
                .bind(range.from)
                .bind(range.to)
                .bind(limit as i64)
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("ledger_page", e))?;
        decode_entries(&rows)
    }

    fn entries_for_reference(
        &self,
        business_id: BusinessId,
        reference: Reference,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Self::ensure_sync_context()?;
        let rows = self
            .block_on(
                sqlx::query(&format!(
                    r#"
                    {SELECT_LEDGER_ENTRIES}
                    WHERE business_id = $1 AND reference_type = $2 AND reference_id = $3
                    ORDER BY created_at ASC, location_id, variant_id, position ASC
                    "#
                ))
                .bind(*business_id.as_uuid())
                .bind(reference.reference_type.as_str())
                .bind(reference.reference_id)
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("entries_for_reference", e))?;
        decode_entries(&rows)
    }

    fn transfer(
        &self,
        business_id: BusinessId,
        transfer_id: TransferId,
    ) -> Result<Option<Transfer>, StoreError> {
        Self::ensure_sync_context()?;
        let sql = format!("{SELECT_TRANSFERS} WHERE business_id = $1 AND id = $2");
        let loaded = self
            .block_on(async {
                let Some(row) = sqlx::query(&sql)
                    .bind(*business_id.as_uuid())
                    .bind(*transfer_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?
                else {
                    return Ok(None);
                };
                let items = sqlx::query(SELECT_TRANSFER_ITEMS)
                    .bind(*transfer_id.as_uuid())
                    .fetch_all(&self.pool)
                    .await?;
                let transitions = sqlx::query(SELECT_TRANSFER_TRANSITIONS)
                    .bind(*transfer_id.as_uuid())
                    .fetch_all(&self.pool)
                    .await?;
                Ok::<_, sqlx::Error>(Some((row, items, transitions)))
            })
            .map_err(|e| map_sqlx_error("transfer", e))?;

        match loaded {
            None => Ok(None),
            Some((row, items, transitions)) => decode::<TransferRow>("inventory_transfers", &row)?
                .into_transfer(&items, &transitions)
                .map(Some),
        }
    }

    fn correction(
        &self,
        business_id: BusinessId,
        correction_id: CorrectionId,
    ) -> Result<Option<Correction>, StoreError> {
        Self::ensure_sync_context()?;
        let row = self
            .block_on(
                sqlx::query(&format!("{SELECT_CORRECTIONS} WHERE business_id = $1 AND id = $2"))
                    .bind(*business_id.as_uuid())
                    .bind(*correction_id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("correction", e))?;
        row.as_ref().map(decode_correction).transpose()
    }

    fn corrections(
        &self,
        business_id: BusinessId,
        status: Option<CorrectionStatus>,
    ) -> Result<Vec<Correction>, StoreError> {
        Self::ensure_sync_context()?;
        let rows = self
            .block_on(
                sqlx::query(&format!(
                    r#"
                    {SELECT_CORRECTIONS}
                    WHERE business_id = $1 AND ($2::text IS NULL OR status = $2)
                    ORDER BY created_at DESC, id DESC
                    "#
                ))
                .bind(*business_id.as_uuid())
                .bind(status.map(CorrectionStatus::as_str))
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("corrections", e))?;
        rows.iter().map(decode_correction).collect()
    }

    #[instrument(
        skip(self),
        fields(
            business_id = %scope.business_id,
            location_id = %scope.location_id,
            date = %scope.date
        ),
        err
    )]
    fn next_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError> {
        Self::ensure_sync_context()?;
        let row = self
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO inventory_sequence_counters
                        (business_id, location_id, year, month, day, counter)
                    VALUES ($1, $2, $3, $4, $5, 1)
                    ON CONFLICT (business_id, location_id, year, month, day)
                    DO UPDATE SET counter = inventory_sequence_counters.counter + 1
                    RETURNING counter
                    "#,
                )
                .bind(*scope.business_id.as_uuid())
                .bind(*scope.location_id.as_uuid())
                .bind(scope.year())
                .bind(scope.month() as i32)
                .bind(scope.day() as i32)
                .fetch_one(&self.pool),
            )
            .map_err(|e| map_sqlx_error("next_sequence", e))?;
        let counter: i64 = row
            .try_get("counter")
            .map_err(|e| StoreError::corrupt("inventory_sequence_counters", e.to_string()))?;
        Ok(counter as u64)
    }

    fn current_sequence(&self, scope: SequenceScope) -> Result<u64, StoreError> {
        Self::ensure_sync_context()?;
        let row = self
            .block_on(
                sqlx::query(
                    r#"
                    SELECT counter FROM inventory_sequence_counters
                    WHERE business_id = $1 AND location_id = $2
                      AND year = $3 AND month = $4 AND day = $5
                    "#,
                )
                .bind(*scope.business_id.as_uuid())
                .bind(*scope.location_id.as_uuid())
                .bind(scope.year())
                .bind(scope.month() as i32)
                .bind(scope.day() as i32)
                .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("current_sequence", e))?;
        match row {
            None => Ok(0),
            Some(row) => {
                let counter: i64 = row
                    .try_get("counter")
                    .map_err(|e| {
                        StoreError::corrupt("inventory_sequence_counters", e.to_string())
                    })?;
                Ok(counter as u64)
            }
        }
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") | Some("40P01") => StoreError::LockTimeout(msg),
                Some("23505") | Some("40001") => StoreError::Contention(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("{operation}: connection pool closed"))
        }
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

fn decode<'r, T: FromRow<'r, PgRow>>(table: &'static str, row: &'r PgRow) -> Result<T, StoreError> {
    T::from_row(row).map_err(|e| StoreError::corrupt(table, e.to_string()))
}

fn decode_snapshot(row: &PgRow) -> Result<Snapshot, StoreError> {
    decode::<SnapshotRow>("inventory_snapshots", row).map(Snapshot::from)
}

fn decode_correction(row: &PgRow) -> Result<Correction, StoreError> {
    Correction::try_from(decode::<CorrectionRow>("inventory_corrections", row)?)
}

fn decode_entries(rows: &[PgRow]) -> Result<Vec<LedgerEntry>, StoreError> {
    rows.iter()
        .map(|r| LedgerEntry::try_from(decode::<LedgerEntryRow>("inventory_ledger_entries", r)?))
        .collect()
}

fn parse<T>(table: &'static str, raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::corrupt(table, e.to_string()))
}

const SELECT_LEDGER_ENTRIES: &str = r#"
    SELECT id, business_id, location_id, variant_id, entry_type, quantity_delta, balance_after,
           position, reference_type, reference_id, unit_cost, actor_id, created_at
    FROM inventory_ledger_entries
"#;

const SELECT_TRANSFERS: &str = r#"
    SELECT id, business_id, number, from_location, to_location, status, stock_deducted,
           deduction_reversed, note, status_reason, version
    FROM inventory_transfers
"#;

const SELECT_TRANSFER_ITEMS: &str = r#"
    SELECT variant_id, qty_requested, qty_verified
    FROM inventory_transfer_items
    WHERE transfer_id = $1
    ORDER BY line_no ASC
"#;

const SELECT_TRANSFER_TRANSITIONS: &str = r#"
    SELECT status, actor_id, at
    FROM inventory_transfer_transitions
    WHERE transfer_id = $1
    ORDER BY seq ASC
"#;

const SELECT_CORRECTIONS: &str = r#"
    SELECT id, business_id, number, location_id, variant_id, system_count, physical_count,
           difference, status, source, reason, created_by, created_at, decided_by, decided_at,
           linked_ledger_entry_id, version
    FROM inventory_corrections
"#;

// SQLx row types

#[derive(Debug)]
struct SnapshotRow {
    business_id: Uuid,
    location_id: Uuid,
    variant_id: Uuid,
    qty_available: i64,
    entry_count: i64,
    last_updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            business_id: row.try_get("business_id")?,
            location_id: row.try_get("location_id")?,
            variant_id: row.try_get("variant_id")?,
            qty_available: row.try_get("qty_available")?,
            entry_count: row.try_get("entry_count")?,
            last_updated_at: row.try_get("last_updated_at")?,
        })
    }
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Snapshot {
            business_id: BusinessId::from_uuid(row.business_id),
            dimension: Dimension::new(
                ProductVariantId::from_uuid(row.variant_id),
                LocationId::from_uuid(row.location_id),
            ),
            qty_available: row.qty_available,
            entry_count: row.entry_count as u64,
            last_updated_at: row.last_updated_at,
        }
    }
}

#[derive(Debug)]
struct LedgerEntryRow {
    id: Uuid,
    business_id: Uuid,
    location_id: Uuid,
    variant_id: Uuid,
    entry_type: String,
    quantity_delta: i64,
    balance_after: i64,
    position: i64,
    reference_type: String,
    reference_id: Uuid,
    unit_cost: Option<i64>,
    actor_id: Uuid,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LedgerEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerEntryRow {
            id: row.try_get("id")?,
            business_id: row.try_get("business_id")?,
            location_id: row.try_get("location_id")?,
            variant_id: row.try_get("variant_id")?,
            entry_type: row.try_get("entry_type")?,
            quantity_delta: row.try_get("quantity_delta")?,
            balance_after: row.try_get("balance_after")?,
            position: row.try_get("position")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            unit_cost: row.try_get("unit_cost")?,
            actor_id: row.try_get("actor_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerEntryRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "inventory_ledger_entries";
        Ok(LedgerEntry {
            id: LedgerEntryId::from_uuid(row.id),
            business_id: BusinessId::from_uuid(row.business_id),
            dimension: Dimension::new(
                ProductVariantId::from_uuid(row.variant_id),
                LocationId::from_uuid(row.location_id),
            ),
            entry_type: parse(TABLE, &row.entry_type)?,
            quantity_delta: row.quantity_delta,
            balance_after: row.balance_after,
            position: row.position as u64,
            reference: Reference::new(parse(TABLE, &row.reference_type)?, row.reference_id),
            unit_cost: row.unit_cost.map(|c| c as u64),
            actor_id: UserId::from_uuid(row.actor_id),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct TransferRow {
    id: Uuid,
    business_id: Uuid,
    number: String,
    from_location: Uuid,
    to_location: Uuid,
    status: String,
    stock_deducted: bool,
    deduction_reversed: bool,
    note: Option<String>,
    status_reason: Option<String>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for TransferRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransferRow {
            id: row.try_get("id")?,
            business_id: row.try_get("business_id")?,
            number: row.try_get("number")?,
            from_location: row.try_get("from_location")?,
            to_location: row.try_get("to_location")?,
            status: row.try_get("status")?,
            stock_deducted: row.try_get("stock_deducted")?,
            deduction_reversed: row.try_get("deduction_reversed")?,
            note: row.try_get("note")?,
            status_reason: row.try_get("status_reason")?,
            version: row.try_get("version")?,
        })
    }
}

impl TransferRow {
    fn into_transfer(self, items: &[PgRow], transitions: &[PgRow]) -> Result<Transfer, StoreError> {
        const TABLE: &str = "inventory_transfers";

        let items = items
            .iter()
            .map(|r| -> Result<TransferItem, sqlx::Error> {
                Ok(TransferItem {
                    variant_id: ProductVariantId::from_uuid(r.try_get("variant_id")?),
                    qty_requested: r.try_get("qty_requested")?,
                    qty_verified: r.try_get("qty_verified")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| StoreError::corrupt("inventory_transfer_items", e.to_string()))?;

        let transitions = transitions
            .iter()
            .map(|r| -> Result<TransitionRecord, StoreError> {
                let status: String = r
                    .try_get("status")
                    .map_err(|e| {
                        StoreError::corrupt("inventory_transfer_transitions", e.to_string())
                    })?;
                let actor_id: Uuid = r
                    .try_get("actor_id")
                    .map_err(|e| {
                        StoreError::corrupt("inventory_transfer_transitions", e.to_string())
                    })?;
                let at: DateTime<Utc> = r
                    .try_get("at")
                    .map_err(|e| {
                        StoreError::corrupt("inventory_transfer_transitions", e.to_string())
                    })?;
                Ok(TransitionRecord {
                    status: parse("inventory_transfer_transitions", &status)?,
                    actor_id: UserId::from_uuid(actor_id),
                    at,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Transfer {
            id: TransferId::from_uuid(self.id),
            business_id: BusinessId::from_uuid(self.business_id),
            number: self.number,
            from_location: LocationId::from_uuid(self.from_location),
            to_location: LocationId::from_uuid(self.to_location),
            status: parse(TABLE, &self.status)?,
            stock_deducted: self.stock_deducted,
            deduction_reversed: self.deduction_reversed,
            items,
            transitions,
            note: self.note,
            status_reason: self.status_reason,
            version: self.version as u64,
        })
    }
}

#[derive(Debug)]
struct CorrectionRow {
    id: Uuid,
    business_id: Uuid,
    number: String,
    location_id: Uuid,
    variant_id: Uuid,
    system_count: i64,
    physical_count: i64,
    difference: i64,
    status: String,
    source: serde_json::Value,
    reason: Option<String>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    decided_by: Option<Uuid>,
    decided_at: Option<DateTime<Utc>>,
    linked_ledger_entry_id: Option<Uuid>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for CorrectionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CorrectionRow {
            id: row.try_get("id")?,
            business_id: row.try_get("business_id")?,
            number: row.try_get("number")?,
            location_id: row.try_get("location_id")?,
            variant_id: row.try_get("variant_id")?,
            system_count: row.try_get("system_count")?,
            physical_count: row.try_get("physical_count")?,
            difference: row.try_get("difference")?,
            status: row.try_get("status")?,
            source: row.try_get("source")?,
            reason: row.try_get("reason")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            decided_by: row.try_get("decided_by")?,
            decided_at: row.try_get("decided_at")?,
            linked_ledger_entry_id: row.try_get("linked_ledger_entry_id")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<CorrectionRow> for Correction {
    type Error = StoreError;

    fn try_from(row: CorrectionRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "inventory_corrections";
        Ok(Correction {
            id: CorrectionId::from_uuid(row.id),
            business_id: BusinessId::from_uuid(row.business_id),
            number: row.number,
            dimension: Dimension::new(
                ProductVariantId::from_uuid(row.variant_id),
                LocationId::from_uuid(row.location_id),
            ),
            system_count: row.system_count,
            physical_count: row.physical_count,
            difference: row.difference,
            status: parse(TABLE, &row.status)?,
            source: serde_json::from_value(row.source)
                .map_err(|e| StoreError::corrupt(TABLE, e.to_string()))?,
            reason: row.reason,
            created_by: UserId::from_uuid(row.created_by),
            created_at: row.created_at,
            decided_by: row.decided_by.map(UserId::from_uuid),
            decided_at: row.decided_at,
            linked_ledger_entry_id: row.linked_ledger_entry_id.map(LedgerEntryId::from_uuid),
            version: row.version as u64,
        })
    }
}

/// These run only when `STOCKFLOW_TEST_DATABASE_URL` points at a scratch database.
#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_inventory::{LedgerDraft, LedgerEntryType, ReferenceType, StockPolicy};

    fn store() -> Option<PostgresInventoryStore> {
        let url = std::env::var("STOCKFLOW_TEST_DATABASE_URL").ok()?;
        let options = PostgresStoreOptions::new(url).with_lock_timeout(Duration::from_millis(100));
        let store = PostgresInventoryStore::connect(&options).expect("connect");
        store.migrate().expect("migrate");
        Some(store)
    }

    fn dim() -> Dimension {
        Dimension::new(ProductVariantId::new(), LocationId::new())
    }

    fn post(
        uow: &mut PgUnitOfWork<'_>,
        business: BusinessId,
        d: Dimension,
        qty: i64,
    ) -> LedgerEntry {
        let current = uow
            .lock_snapshot(business, d)
            .unwrap()
            .unwrap_or_else(|| Snapshot::empty(business, d, Utc::now()));
        let draft = LedgerDraft::new(
            d,
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
        entry
    }

    #[test]
    fn committed_entries_round_trip() {
        let Some(store) = store() else { return };
        let business = BusinessId::new();
        let d = dim();

        let mut uow = store.begin().unwrap();
        let first = post(&mut uow, business, d, 10);
        post(&mut uow, business, d, -3);
        uow.commit().unwrap();

        let snapshot = store.snapshot(business, d).unwrap().unwrap();
        assert_eq!(snapshot.qty_available, 7);
        assert_eq!(snapshot.entry_count, 2);

        let page = store
            .ledger_page(business, d, HistoryRange::all(), 0, 10)
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0], first);
    }

    #[test]
    fn rolled_back_work_leaves_nothing() {
        let Some(store) = store() else { return };
        let business = BusinessId::new();
        let d = dim();

        {
            let mut uow = store.begin().unwrap();
            post(&mut uow, business, d, 10);
        }

        assert!(store.snapshot(business, d).unwrap().is_none());
    }

    #[test]
    fn second_writer_times_out_on_a_locked_dimension() {
        let Some(store) = store() else { return };
        let business = BusinessId::new();
        let d = dim();

        let mut seed = store.begin().unwrap();
        post(&mut seed, business, d, 1);
        seed.commit().unwrap();

        let mut holder = store.begin().unwrap();
        holder.lock_snapshot(business, d).unwrap();

        let mut waiter = store.begin().unwrap();
        assert!(matches!(
            waiter.lock_snapshot(business, d),
            Err(StoreError::LockTimeout(_))
        ));
    }

    #[test]
    fn sequence_counter_increments_atomically() {
        let Some(store) = store() else { return };
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
