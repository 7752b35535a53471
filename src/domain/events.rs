use crate::domain::event_version::{EventVersion, VersionedEvent};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub const CHAT_ROOM_TOPIC: &str = "chat-rooms";
pub const CHAT_MESSAGE_TOPIC: &str = "chat-messages";

/// A concrete event payload with a stable tag, its logical topic and the
/// schema version producers stamp on it.
pub trait ChatEventPayload: Serialize + DeserializeOwned + Into<ChatEvent> {
    const EVENT_TYPE: &'static str;
    const TOPIC: &'static str;
    const VERSION: EventVersion;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoomCreated {
    pub chat_room_id: Uuid,
    pub name: String,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoomDeleted {
    pub chat_room_id: Uuid,
    pub deleted_by: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberJoined {
    pub chat_room_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberLeft {
    pub chat_room_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSent {
    pub message_id: Uuid,
    pub chat_room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    /// Added in 1.1.0; older producers omit it.
    #[serde(default)]
    pub reply_to: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEdited {
    pub message_id: Uuid,
    pub chat_room_id: Uuid,
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeleted {
    pub message_id: Uuid,
    pub chat_room_id: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ChatRoomCreated(ChatRoomCreated),
    ChatRoomDeleted(ChatRoomDeleted),
    MemberJoined(MemberJoined),
    MemberLeft(MemberLeft),
    MessageSent(MessageSent),
    MessageEdited(MessageEdited),
    MessageDeleted(MessageDeleted),
}

macro_rules! chat_event_payload {
    ($ty:ident, $tag:literal, $topic:expr, $version:expr) => {
        impl ChatEventPayload for $ty {
            const EVENT_TYPE: &'static str = $tag;
            const TOPIC: &'static str = $topic;
            const VERSION: EventVersion = $version;
        }

        impl From<$ty> for ChatEvent {
            fn from(payload: $ty) -> Self {
                ChatEvent::$ty(payload)
            }
        }
    };
}

chat_event_payload!(ChatRoomCreated, "chat.room.created", CHAT_ROOM_TOPIC, EventVersion::V1);
chat_event_payload!(ChatRoomDeleted, "chat.room.deleted", CHAT_ROOM_TOPIC, EventVersion::V1);
chat_event_payload!(MemberJoined, "chat.room.member_joined", CHAT_ROOM_TOPIC, EventVersion::V1);
chat_event_payload!(MemberLeft, "chat.room.member_left", CHAT_ROOM_TOPIC, EventVersion::V1);
chat_event_payload!(
    MessageSent,
    "chat.message.sent",
    CHAT_MESSAGE_TOPIC,
    EventVersion::new(1, 1, 0)
);
chat_event_payload!(MessageEdited, "chat.message.edited", CHAT_MESSAGE_TOPIC, EventVersion::V1);
chat_event_payload!(MessageDeleted, "chat.message.deleted", CHAT_MESSAGE_TOPIC, EventVersion::V1);

impl ChatEvent {
    /// Owning aggregate; used as the publish key so per-room order is kept.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            ChatEvent::ChatRoomCreated(e) => e.chat_room_id,
            ChatEvent::ChatRoomDeleted(e) => e.chat_room_id,
            ChatEvent::MemberJoined(e) => e.chat_room_id,
            ChatEvent::MemberLeft(e) => e.chat_room_id,
            ChatEvent::MessageSent(e) => e.chat_room_id,
            ChatEvent::MessageEdited(e) => e.chat_room_id,
            ChatEvent::MessageDeleted(e) => e.chat_room_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::ChatRoomCreated(_) => ChatRoomCreated::EVENT_TYPE,
            ChatEvent::ChatRoomDeleted(_) => ChatRoomDeleted::EVENT_TYPE,
            ChatEvent::MemberJoined(_) => MemberJoined::EVENT_TYPE,
            ChatEvent::MemberLeft(_) => MemberLeft::EVENT_TYPE,
            ChatEvent::MessageSent(_) => MessageSent::EVENT_TYPE,
            ChatEvent::MessageEdited(_) => MessageEdited::EVENT_TYPE,
            ChatEvent::MessageDeleted(_) => MessageDeleted::EVENT_TYPE,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            ChatEvent::ChatRoomCreated(_) => ChatRoomCreated::TOPIC,
            ChatEvent::ChatRoomDeleted(_) => ChatRoomDeleted::TOPIC,
            ChatEvent::MemberJoined(_) => MemberJoined::TOPIC,
            ChatEvent::MemberLeft(_) => MemberLeft::TOPIC,
            ChatEvent::MessageSent(_) => MessageSent::TOPIC,
            ChatEvent::MessageEdited(_) => MessageEdited::TOPIC,
            ChatEvent::MessageDeleted(_) => MessageDeleted::TOPIC,
        }
    }

    pub fn version(&self) -> EventVersion {
        match self {
            ChatEvent::ChatRoomCreated(_) => ChatRoomCreated::VERSION,
            ChatEvent::ChatRoomDeleted(_) => ChatRoomDeleted::VERSION,
            ChatEvent::MemberJoined(_) => MemberJoined::VERSION,
            ChatEvent::MemberLeft(_) => MemberLeft::VERSION,
            ChatEvent::MessageSent(_) => MessageSent::VERSION,
            ChatEvent::MessageEdited(_) => MessageEdited::VERSION,
            ChatEvent::MessageDeleted(_) => MessageDeleted::VERSION,
        }
    }

    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            ChatEvent::ChatRoomCreated(e) => serde_json::to_value(e),
            ChatEvent::ChatRoomDeleted(e) => serde_json::to_value(e),
            ChatEvent::MemberJoined(e) => serde_json::to_value(e),
            ChatEvent::MemberLeft(e) => serde_json::to_value(e),
            ChatEvent::MessageSent(e) => serde_json::to_value(e),
            ChatEvent::MessageEdited(e) => serde_json::to_value(e),
            ChatEvent::MessageDeleted(e) => serde_json::to_value(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

type DecodeFn = fn(serde_json::Value) -> Result<ChatEvent, serde_json::Error>;

fn decode_as<T: ChatEventPayload>(value: serde_json::Value) -> Result<ChatEvent, serde_json::Error> {
    serde_json::from_value::<T>(value).map(Into::into)
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryEntry {
    pub topic: &'static str,
    pub version: EventVersion,
    decode: DecodeFn,
}

/// Maps stored `event_type` tags to decoders for the matching payload.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    entries: HashMap<&'static str, RegistryEntry>,
}

static CHAT_REGISTRY: Lazy<EventRegistry> = Lazy::new(|| {
    let mut registry = EventRegistry::default();
    registry
        .register::<ChatRoomCreated>()
        .register::<ChatRoomDeleted>()
        .register::<MemberJoined>()
        .register::<MemberLeft>()
        .register::<MessageSent>()
        .register::<MessageEdited>()
        .register::<MessageDeleted>();
    registry
});

impl EventRegistry {
    /// Registry with every chat event known to this build.
    pub fn chat() -> &'static EventRegistry {
        &CHAT_REGISTRY
    }

    pub fn register<T: ChatEventPayload>(&mut self) -> &mut Self {
        self.entries.insert(
            T::EVENT_TYPE,
            RegistryEntry {
                topic: T::TOPIC,
                version: T::VERSION,
                decode: decode_as::<T>,
            },
        );
        self
    }

    pub fn entry(&self, event_type: &str) -> Option<&RegistryEntry> {
        self.entries.get(event_type)
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.entries.contains_key(event_type)
    }

    pub fn decode(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<ChatEvent, EventDecodeError> {
        let entry = self
            .entry(event_type)
            .ok_or_else(|| EventDecodeError::UnknownEventType(event_type.to_string()))?;
        (entry.decode)(payload).map_err(|source| EventDecodeError::Malformed {
            event_type: event_type.to_string(),
            source,
        })
    }
}

/// Wire form of a published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub saga_id: Uuid,
    pub event_type: String,
    pub version: EventVersion,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn wrap(
        event_id: Uuid,
        saga_id: Uuid,
        event: &ChatEvent,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id,
            saga_id,
            event_type: event.event_type().to_string(),
            version: event.version(),
            aggregate_id: event.aggregate_id().to_string(),
            occurred_at,
            payload: event.payload_json()?,
        })
    }
}

impl VersionedEvent for EventEnvelope {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn version(&self) -> EventVersion {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_by_stored_tag() {
        let room = Uuid::new_v4();
        let event = ChatEvent::MessageDeleted(MessageDeleted {
            message_id: Uuid::new_v4(),
            chat_room_id: room,
        });
        let payload = event.payload_json().unwrap();

        let decoded = EventRegistry::chat()
            .decode("chat.message.deleted", payload)
            .unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.aggregate_id(), room);
        assert_eq!(decoded.topic(), CHAT_MESSAGE_TOPIC);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = EventRegistry::chat()
            .decode("chat.unknown", json!({}))
            .unwrap_err();
        assert!(matches!(err, EventDecodeError::UnknownEventType(t) if t == "chat.unknown"));
    }

    #[test]
    fn malformed_payload_is_reported_with_tag() {
        let err = EventRegistry::chat()
            .decode("chat.room.created", json!({ "name": 3 }))
            .unwrap_err();
        assert!(matches!(err, EventDecodeError::Malformed { ref event_type, .. } if event_type == "chat.room.created"));
    }

    #[test]
    fn message_sent_accepts_payload_without_additive_field() {
        let payload = json!({
            "message_id": Uuid::new_v4(),
            "chat_room_id": Uuid::new_v4(),
            "sender_id": Uuid::new_v4(),
            "content": "hi",
            "sent_at": "2024-03-01T10:00:00Z",
        });
        let decoded = EventRegistry::chat()
            .decode("chat.message.sent", payload)
            .unwrap();
        match decoded {
            ChatEvent::MessageSent(m) => assert_eq!(m.reply_to, None),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn envelope_carries_version_and_key() {
        let room = Uuid::new_v4();
        let event = ChatEvent::ChatRoomCreated(ChatRoomCreated {
            chat_room_id: room,
            name: "general".into(),
            created_by: Uuid::new_v4(),
        });
        let envelope = EventEnvelope::wrap(Uuid::new_v4(), Uuid::new_v4(), &event, Utc::now()).unwrap();
        assert_eq!(envelope.aggregate_id, room.to_string());
        assert_eq!(envelope.version, EventVersion::V1);
        assert_eq!(envelope.event_type, "chat.room.created");
    }
}
