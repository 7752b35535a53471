use crate::domain::event_version::{EventVersion, EventVersionValidator};
use crate::domain::events::{ChatEvent, EventEnvelope, EventRegistry};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeDecision {
    Apply(ChatEvent),
    Skip { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MalformedEnvelope(String),
    UnknownEventType(String),
    IncompatibleVersion {
        actual: EventVersion,
        expected: EventVersion,
    },
    MalformedPayload(String),
}

/// Front door for consumers of published chat events.
///
/// An inbound envelope is applied only when its tag is known to this build
/// and its major version matches the one the build was compiled against.
/// Newer minors decode too, since unknown fields are ignored.
pub struct EventGate {
    consumer_name: String,
    registry: &'static EventRegistry,
    validator: EventVersionValidator,
}

impl EventGate {
    pub fn new(consumer_name: impl Into<String>) -> Self {
        Self::with_registry(consumer_name, EventRegistry::chat())
    }

    pub fn with_registry(consumer_name: impl Into<String>, registry: &'static EventRegistry) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            registry,
            validator: EventVersionValidator::new(),
        }
    }

    /// Parses a raw message body and runs [`admit`](Self::admit) on it.
    pub fn admit_bytes(&self, body: &[u8]) -> ConsumeDecision {
        match serde_json::from_slice::<EventEnvelope>(body) {
            Ok(envelope) => self.admit(envelope),
            Err(e) => {
                warn!(consumer = %self.consumer_name, error = %e, "Dropping unreadable event envelope");
                ConsumeDecision::Skip {
                    reason: SkipReason::MalformedEnvelope(e.to_string()),
                }
            }
        }
    }

    pub fn admit(&self, envelope: EventEnvelope) -> ConsumeDecision {
        let Some(entry) = self.registry.entry(&envelope.event_type) else {
            warn!(
                consumer = %self.consumer_name,
                event_type = %envelope.event_type,
                event_id = %envelope.event_id,
                "Skipping event of unknown type"
            );
            return ConsumeDecision::Skip {
                reason: SkipReason::UnknownEventType(envelope.event_type),
            };
        };

        let expected = entry.version;
        if !self
            .validator
            .is_supported(&envelope, expected, &self.consumer_name)
        {
            return ConsumeDecision::Skip {
                reason: SkipReason::IncompatibleVersion {
                    actual: envelope.version,
                    expected,
                },
            };
        }

        match self.registry.decode(&envelope.event_type, envelope.payload) {
            Ok(event) => {
                debug!(
                    consumer = %self.consumer_name,
                    event_id = %envelope.event_id,
                    saga_id = %envelope.saga_id,
                    event_type = event.event_type(),
                    "Event admitted"
                );
                ConsumeDecision::Apply(event)
            }
            Err(e) => {
                warn!(
                    consumer = %self.consumer_name,
                    event_id = %envelope.event_id,
                    error = %e,
                    "Skipping event with undecodable payload"
                );
                ConsumeDecision::Skip {
                    reason: SkipReason::MalformedPayload(e.to_string()),
                }
            }
        }
    }
}
