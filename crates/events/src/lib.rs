//! `stockflow-events` — notification events published after work commits.
//!
//! The ledger tables are the source of truth; events here are a fan-out
//! channel for collaborators (reporting, accounting, label printing) that react
//! to committed inventory changes.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::{Event, EventEnvelope};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
