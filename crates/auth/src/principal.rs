use serde::{Deserialize, Serialize};

use stockflow_core::BusinessId;

use crate::{Permission, Role};

/// A principal's membership in a business.
///
/// States *which business* the principal is acting within and which roles and
/// permissions are granted there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessMembership {
    pub business_id: BusinessId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

impl BusinessMembership {
    pub fn new(business_id: BusinessId) -> Self {
        Self {
            business_id,
            roles: Vec::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions.extend(permissions);
        self
    }
}
