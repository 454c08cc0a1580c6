use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockflow_core::BusinessId;

/// An immutable, versioned fact about a committed change.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable dotted name, e.g. `inventory.transfer.stock_deducted`.
    fn event_type(&self) -> &'static str;

    /// Payload schema version.
    fn version(&self) -> u32;

    /// Business time of the change.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Envelope for a published event, carrying business + stream metadata.
///
/// - `business_id` scopes the event to one tenant.
/// - `stream_id`/`stream_type` name the document the event belongs to
///   (a transfer, a correction, a ledger dimension).
/// - `sequence_number` is the document version or ledger position the event
///   produced, so consumers can drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    business_id: BusinessId,

    stream_id: Uuid,
    stream_type: String,

    sequence_number: u64,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    /// Wrap `payload`, an encoding of `event`, with a fresh event id.
    pub fn wrap<V: Event>(
        business_id: BusinessId,
        stream_id: Uuid,
        stream_type: impl Into<String>,
        sequence_number: u64,
        event: &V,
        payload: E,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            business_id,
            stream_id,
            stream_type: stream_type.into(),
            sequence_number,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn business_id(&self) -> BusinessId {
        self.business_id
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
