use crate::domain::events::ChatEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Event staged in the same local transaction as the domain write.
///
/// Values are never mutated in place. Each transition returns a new value
/// with `version` bumped, and the store accepts it only if the stored row
/// still has the previous version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub saga_state: SagaState,
    pub version: i64,
}

impl OutboxEvent {
    pub fn is_exhausted(&self, max_retry_count: i32) -> bool {
        self.retry_count >= max_retry_count
    }

    pub fn claimed(&self) -> Self {
        Self {
            saga_state: SagaState::Processing,
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn completed(&self, now: DateTime<Utc>) -> Self {
        Self {
            processed: true,
            processed_at: Some(now),
            saga_state: SagaState::Completed,
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Records one failed publish and hands the row back to the poller.
    ///
    /// Escalation to FAILED is a separate step (`exhausted`) taken once the
    /// dead letter is stored.
    pub fn failed_attempt(&self, error: impl Into<String>) -> Self {
        debug_assert!(!self.processed, "retry count is frozen once processed");
        Self {
            retry_count: self.retry_count + 1,
            last_error: Some(error.into()),
            saga_state: SagaState::Pending,
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn exhausted(&self) -> Self {
        Self {
            saga_state: SagaState::Failed,
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// Outbox row as written by a domain service, before the store assigns identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub saga_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn for_event(saga_id: Uuid, event: &ChatEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            saga_id,
            aggregate_id: event.aggregate_id().to_string(),
            event_type: event.event_type().to_string(),
            payload: event.payload_json()?,
        })
    }

    pub fn into_event(self, id: Uuid, created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id,
            saga_id: self.saga_id,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            created_at,
            processed: false,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            saga_state: SagaState::Pending,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxDeadLetter {
    pub id: Uuid,
    pub outbox_event_id: Uuid,
    pub saga_id: Uuid,
    pub event_type: String,
    pub failure_reason: String,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxDeadLetter {
    pub fn for_exhausted(event: &OutboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbox_event_id: event.id,
            saga_id: event.saga_id,
            event_type: event.event_type.clone(),
            failure_reason: event
                .last_error
                .clone()
                .unwrap_or_else(|| "retries exhausted".to_string()),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::MemberJoined;

    fn pending() -> OutboxEvent {
        let event = ChatEvent::MemberJoined(MemberJoined {
            chat_room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        });
        NewOutboxEvent::for_event(Uuid::new_v4(), &event)
            .unwrap()
            .into_event(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn failures_climb_until_exhausted() {
        let mut event = pending();
        for attempt in 1..=5 {
            let next = event.claimed().failed_attempt(format!("broker down #{attempt}"));
            assert_eq!(next.retry_count, event.retry_count + 1);
            assert_eq!(next.version, event.version + 2);
            assert_eq!(next.saga_state, SagaState::Pending);
            assert!(!next.processed);
            event = next;
        }
        assert!(event.is_exhausted(5));
        assert_eq!(event.last_error.as_deref(), Some("broker down #5"));

        let failed = event.exhausted();
        assert_eq!(failed.saga_state, SagaState::Failed);
        assert_eq!(failed.retry_count, 5);
        assert!(!failed.processed);
    }

    #[test]
    fn completion_sets_processed_fields() {
        let now = Utc::now();
        let event = pending().claimed().completed(now);
        assert!(event.processed);
        assert_eq!(event.processed_at, Some(now));
        assert_eq!(event.saga_state, SagaState::Completed);
        assert_eq!(event.version, 2);
    }

    #[test]
    fn saga_state_round_trips_through_column_text() {
        assert_eq!(SagaState::Processing.as_ref(), "PROCESSING");
        assert_eq!("FAILED".parse::<SagaState>().unwrap(), SagaState::Failed);
    }

    #[test]
    fn dead_letter_copies_last_error() {
        let event = pending().failed_attempt("kafka: broker transport failure");
        let letter = OutboxDeadLetter::for_exhausted(&event, Utc::now());
        assert_eq!(letter.outbox_event_id, event.id);
        assert_eq!(letter.failure_reason, "kafka: broker transport failure");
        assert!(!letter.resolved);
    }
}
