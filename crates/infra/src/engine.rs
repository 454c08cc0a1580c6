//! Inventory engine: the entry point the calling layer holds on to.
//!
//! ## Execution Flow
//!
//! Every mutating operation follows the same pipeline:
//!
//! ```text
//! Principal + payload
//!   ↓
//! 1. Authorize (capability, then separation of duties where configured)
//!   ↓
//! 2. Begin a unit of work and lock the document row, then every touched
//!    dimension in ascending order
//!   ↓
//! 3. Decide (pure domain logic: posting rules, state machine)
//!   ↓
//! 4. Stage ledger entries, snapshots and document state
//!   ↓
//! 5. Commit (all or nothing)
//!   ↓
//! 6. Publish notifications (best effort)
//! ```
//!
//! Lock timeouts and write contention anywhere in steps 2-5 discard the unit
//! of work and rerun the whole pipeline under the configured [`RetryPolicy`].
//! Everything else reaches the caller untouched.
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

use std::sync::Arc;

use stockflow_auth::{Permission, Principal, authorize};
use stockflow_core::BusinessId;

use crate::config::{BusinessPolicy, EngineConfig};
use crate::correction::CorrectionWorkflow;
use crate::error::EngineResult;
use crate::ledger::LedgerService;
use crate::notify::NotificationSink;
use crate::reconciliation::Reconciliation;
use crate::sequence::SequenceGenerator;
use crate::store::InventoryStore;
use crate::transfer::TransferWorkflow;

/// Synchronous, request-driven inventory engine over an [`InventoryStore`].
///
/// Cheap to share behind an `Arc`; it holds no per-request state.
pub struct InventoryEngine<S> {
    pub(crate) store: S,
    pub(crate) config: EngineConfig,
    pub(crate) sink: Option<Arc<dyn NotificationSink>>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for InventoryEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("notifications", &self.sink.is_some())
            .finish()
    }
}

impl<S: InventoryStore> InventoryEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            sink: None,
        }
    }

    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> LedgerService<'_, S> {
        LedgerService::new(self)
    }

    pub fn sequences(&self) -> SequenceGenerator<'_, S> {
        SequenceGenerator::new(self)
    }

    pub fn transfers(&self) -> TransferWorkflow<'_, S> {
        TransferWorkflow::new(self)
    }

    pub fn corrections(&self) -> CorrectionWorkflow<'_, S> {
        CorrectionWorkflow::new(self)
    }

    pub fn reconciliation(&self) -> Reconciliation<'_, S> {
        Reconciliation::new(self)
    }

    pub(crate) fn policy(&self, business_id: BusinessId) -> &BusinessPolicy {
        self.config.policy_for(business_id)
    }

    pub(crate) fn sink(&self) -> Option<&dyn NotificationSink> {
        self.sink.as_deref()
    }

    /// Capability check; yields the business the principal acts in.
    pub(crate) fn authorize(
        &self,
        principal: &Principal,
        required: &Permission,
    ) -> EngineResult<BusinessId> {
        authorize(principal, required)?;
        Ok(principal.business_id())
    }
}
