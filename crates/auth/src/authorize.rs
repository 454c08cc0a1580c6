use thiserror::Error;

use stockflow_core::{BusinessId, UserId};

use crate::{BusinessMembership, Permission, Role};

/// A fully resolved principal for authorization decisions.
///
/// Construction is decoupled from storage and transport: the calling layer
/// derives the membership from its session and hands it to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub active_business_id: BusinessId,
    pub membership: BusinessMembership,
}

impl Principal {
    /// Principal acting inside the business of its membership.
    pub fn new(user_id: UserId, membership: BusinessMembership) -> Self {
        Self {
            user_id,
            active_business_id: membership.business_id,
            membership,
        }
    }

    pub fn business_id(&self) -> BusinessId {
        self.active_business_id
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.membership.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &Permission) -> bool {
        self.membership
            .permissions
            .iter()
            .any(|p| p.grants(permission))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("business mismatch")]
    BusinessMismatch,

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),

    #[error("separation of duties: actor of '{step}' already performed '{conflicting_step}'")]
    SeparationOfDuties {
        step: String,
        conflicting_step: String,
    },
}

/// Authorize a principal within its active business context.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.active_business_id != principal.membership.business_id {
        return Err(AuthzError::BusinessMismatch);
    }

    if principal.has_permission(required) {
        Ok(())
    } else {
        tracing::debug!(
            user_id = %principal.user_id,
            permission = %required,
            "authorization denied"
        );
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}
