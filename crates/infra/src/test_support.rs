//! Shared fixtures for unit and integration tests.

use std::time::Duration;

use uuid::Uuid;

use stockflow_auth::{BusinessMembership, Permission, Principal, Role};
use stockflow_core::{BusinessId, LocationId, ProductVariantId, UserId};
use stockflow_inventory::{Dimension, LedgerDraft, LedgerEntryType, Reference, ReferenceType};

use crate::config::EngineConfig;
use crate::engine::InventoryEngine;
use crate::retry::RetryPolicy;
use crate::store::InMemoryInventoryStore;

pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy::fixed(2, Duration::from_millis(1))
}

pub(crate) fn engine() -> InventoryEngine<InMemoryInventoryStore> {
    engine_with(EngineConfig::default())
}

pub(crate) fn engine_with(config: EngineConfig) -> InventoryEngine<InMemoryInventoryStore> {
    let _ = stockflow_observability::init_for_tests();
    InventoryEngine::new(
        InMemoryInventoryStore::new().with_lock_timeout(Duration::from_millis(50)),
        config.with_retry(fast_retry()),
    )
}

/// New business with one member holding `permissions`.
pub(crate) fn member(permissions: &[&Permission]) -> (BusinessId, Principal) {
    member_of(BusinessId::new(), permissions)
}

pub(crate) fn member_of(
    business: BusinessId,
    permissions: &[&Permission],
) -> (BusinessId, Principal) {
    let membership = BusinessMembership::new(business)
        .with_permissions(permissions.iter().map(|p| (*p).clone()));
    (business, Principal::new(UserId::new(), membership))
}

/// Member holding every capability.
pub(crate) fn admin_of(business: BusinessId) -> Principal {
    let membership = BusinessMembership::new(business).with_permission(Permission::new("*"));
    Principal::new(UserId::new(), membership)
}

pub(crate) fn with_role(mut principal: Principal, role: &'static str) -> Principal {
    principal.membership = principal.membership.with_role(Role::from_static(role));
    principal
}

pub(crate) fn dimension() -> Dimension {
    Dimension::new(ProductVariantId::new(), LocationId::new())
}

pub(crate) fn purchase(dimension: Dimension, qty: i64) -> LedgerDraft {
    LedgerDraft::new(
        dimension,
        LedgerEntryType::Purchase,
        qty,
        Reference::new(ReferenceType::PurchaseReceipt, Uuid::now_v7()),
    )
}

pub(crate) fn sale(dimension: Dimension, qty: i64) -> LedgerDraft {
    LedgerDraft::new(
        dimension,
        LedgerEntryType::Sale,
        -qty,
        Reference::new(ReferenceType::SalesInvoice, Uuid::now_v7()),
    )
}
