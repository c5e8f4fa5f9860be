//! Wire envelope types and codec.
//!
//! Every frame on the socket is one JSON envelope:
//! `{ "type": ..., "data": {...}, "user_id": ..., "timestamp": ... }`.
//! `type`/`data` decode into an adjacently tagged enum so routing fields are
//! typed per kind; unrecognized payload fields are kept (flattened maps) so
//! relayed envelopes reach the recipient byte-for-byte in content.
//!
//! `user_id` and `timestamp` are stamped by the server when an envelope is
//! received — whatever the client put there is discarded.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Largest inbound frame we accept, in bytes. Anything bigger is a protocol
/// violation and closes the connection.
pub const MAX_FRAME_SIZE: usize = 512;

/// Decode/validation failures for inbound frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame was not a valid envelope. Non-fatal: the frame is dropped.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Frame exceeded [`MAX_FRAME_SIZE`]. Fatal: the connection is closed.
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversized(usize),
}

/// Online/offline state carried in `user_status` envelopes and tracked by the
/// presence store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
    Busy,
    Invisible,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::Invisible => "invisible",
        }
    }
}

/// Payload addressed to a chat: `chat_id` picks the recipients, everything
/// else rides along untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub chat_id: Uuid,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Payload addressed to a single user (call signaling, read receipts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectPayload {
    pub target_user_id: Uuid,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Presence change, broadcast by the hub on register/unregister.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub user_id: Uuid,
    pub status: UserStatus,
}

/// The fields pushed in a `new_contact` notification. Mirrors what the
/// contact-management subsystem knows about the new contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSummary {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Payload of a server-to-client `new_contact` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactPayload {
    pub contact_id: Uuid,
    pub contact: ContactSummary,
    #[serde(default)]
    pub nickname: String,
}

/// Payload of `user_joined` / `user_left` chat membership events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipPayload {
    pub user_id: Uuid,
    pub chat_id: Uuid,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// The closed set of envelope kinds. Wire tags are fixed for client
/// compatibility; presence changes travel as `user_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Chat(ChatPayload),
    Typing(ChatPayload),
    UserStatus(StatusPayload),
    CallOffer(DirectPayload),
    CallAnswer(DirectPayload),
    CallReject(DirectPayload),
    CallEnd(DirectPayload),
    MessageRead(DirectPayload),
    NewContact(ContactPayload),
    UserJoined(MembershipPayload),
    UserLeft(MembershipPayload),
}

impl Payload {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::Typing(_) => "typing",
            Self::UserStatus(_) => "user_status",
            Self::CallOffer(_) => "call_offer",
            Self::CallAnswer(_) => "call_answer",
            Self::CallReject(_) => "call_reject",
            Self::CallEnd(_) => "call_end",
            Self::MessageRead(_) => "message_read",
            Self::NewContact(_) => "new_contact",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
        }
    }
}

/// One wire message. `user_id` and `timestamp` identify the sender and the
/// server receive time; both are server-stamped and never trusted inbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default)]
    pub user_id: Uuid,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Build a server-originated envelope stamped with the current time.
    pub fn server(payload: Payload, user_id: Uuid) -> Self {
        Self {
            payload,
            user_id,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Presence-change envelope broadcast on register/unregister.
    pub fn user_status(user_id: Uuid, status: UserStatus) -> Self {
        Self::server(Payload::UserStatus(StatusPayload { user_id, status }), user_id)
    }

    /// Decode an inbound frame, enforcing the frame size cap first.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversized(frame.len()));
        }
        Ok(serde_json::from_str(frame)?)
    }

    /// Serialize to one text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Overwrite the sender identity and receive timestamp. Called once per
    /// inbound envelope, before routing.
    pub fn stamp(&mut self, sender: Uuid) {
        self.user_id = sender;
        self.timestamp = Utc::now().timestamp();
    }
}
