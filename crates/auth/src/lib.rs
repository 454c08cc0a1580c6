//! `stockflow-auth` — pure authorization boundary for inventory operations.
//!
//! Authentication and session handling live with the caller; this crate only
//! decides whether an already-identified principal may perform a step.

pub mod authorize;
pub mod capability;
pub mod principal;
pub mod sod;

pub use authorize::{AuthzError, Principal, authorize};
pub use capability::{Permission, Role};
pub use principal::BusinessMembership;
pub use sod::{DutyRule, SeparationOfDuties};
