//! Capability and role names.
//!
//! Both are opaque dotted strings at this layer. Permissions gate operations;
//! roles only matter as separation-of-duties exemptions.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// A capability such as `inventory.transfer.approve`.
///
/// `*` grants everything and `inventory.transfer.*` grants every capability
/// under that namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }

    /// Whether holding `self` satisfies a check for `required`.
    pub fn grants(&self, required: &Permission) -> bool {
        if self.is_wildcard() || self == required {
            return true;
        }
        match self.as_str().strip_suffix(".*") {
            Some(namespace) => required
                .as_str()
                .strip_prefix(namespace)
                .is_some_and(|rest| rest.starts_with('.')),
            None => false,
        }
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPROVE: Permission = Permission::from_static("inventory.transfer.approve");

    #[test]
    fn exact_and_global_wildcard() {
        assert!(APPROVE.grants(&APPROVE));
        assert!(Permission::new("*").grants(&APPROVE));
        assert!(!Permission::new("inventory.transfer.send").grants(&APPROVE));
    }

    #[test]
    fn namespace_wildcard_stops_at_segment_boundaries() {
        assert!(Permission::new("inventory.transfer.*").grants(&APPROVE));
        assert!(Permission::new("inventory.*").grants(&APPROVE));
        assert!(!Permission::new("inventory.trans.*").grants(&APPROVE));
        assert!(!Permission::new("inventory.correction.*").grants(&APPROVE));
    }

    #[test]
    fn serializes_as_a_bare_string() {
        let json = serde_json::to_string(&Role::from_static("inventory_supervisor")).unwrap();
        assert_eq!(json, "\"inventory_supervisor\"");
    }
}
