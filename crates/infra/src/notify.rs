//! Post-commit notifications.
//!
//! Publishing happens after the unit of work committed; a failing sink is
//! logged and otherwise ignored since the ledger already holds the truth.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use stockflow_core::BusinessId;
use stockflow_events::{Event, EventBus, EventEnvelope};

/// Object-safe view over an [`EventBus`] carrying JSON envelopes.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, envelope: EventEnvelope<Value>) -> Result<(), String>;
}

impl<B> NotificationSink for B
where
    B: EventBus<EventEnvelope<Value>>,
{
    fn publish(&self, envelope: EventEnvelope<Value>) -> Result<(), String> {
        EventBus::publish(self, envelope).map_err(|e| format!("{e:?}"))
    }
}

/// Which document an event belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stream {
    pub id: Uuid,
    pub kind: &'static str,
    pub sequence: u64,
}

impl Stream {
    pub(crate) fn new(id: impl Into<Uuid>, kind: &'static str, sequence: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            sequence,
        }
    }
}

/// Wrap `event` and hand it to `sink`. Best effort.
pub(crate) fn publish<E>(
    sink: Option<&dyn NotificationSink>,
    business_id: BusinessId,
    stream: Stream,
    event: &E,
) where
    E: Event + Serialize,
{
    let Some(sink) = sink else { return };

    let payload = match serde_json::to_value(event) {
        Ok(v) => v,
        Err(e) => {
            warn!(event_type = event.event_type(), error = %e, "failed to serialize notification");
            return;
        }
    };

    let envelope = EventEnvelope::wrap(
        business_id,
        stream.id,
        stream.kind,
        stream.sequence,
        event,
        payload,
    );

    if let Err(error) = sink.publish(envelope) {
        warn!(
            event_type = event.event_type(),
            stream_type = stream.kind,
            stream_id = %stream.id,
            %error,
            "notification publish failed"
        );
    }
}
