//! Shared domain types and wire frames for the Murmur platform.
//!
//! This crate provides the entity records held by the local-first store
//! (users, sessions, messages), the runtime-only connection descriptor, and
//! the JSON frame types exchanged over the relay and voice-provider
//! WebSockets.
//!
//! No crate in the workspace depends on anything *except* `murmur-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};

/// The author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// A message written (or spoken) by the human user.
    User,
    /// A message produced by the voice assistant.
    Assistant,
}

impl MessageRole {
    /// Returns the lowercase string label used on the wire and in rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Attempts to parse a lowercase role label.
    ///
    /// Returns `None` for unknown labels.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A user identity mirrored from the external identity provider.
///
/// Created by the webhook handler on a `user.created` event and deleted on
/// `user.deleted`. `config_id` references the externally provisioned
/// voice-AI configuration; `None` means provisioning is pending or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub config_id: Option<String>,
    pub system_prompt: Option<String>,
}

impl User {
    /// Constructs a user with only the mandatory id set.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            first_name: None,
            last_name: None,
            config_id: None,
            system_prompt: None,
        }
    }
}

/// A single authenticated conversational run.
///
/// `user_id` is a non-owning reference to [`User`]; no cascading delete is
/// enforced. Sessions are immutable after creation and are never explicitly
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Correlation group for the session. Defaults to the user id.
    pub group_id: Option<String>,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A chat message within a session. Immutable once created.
///
/// `session_id` is a non-owning reference to [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Arbitrary provider-supplied annotations (e.g. prosody scores).
    pub metadata: Option<serde_json::Value>,
}

/// Runtime-only descriptor bound to a live relay socket.
///
/// Owned exclusively by the connection registry and removed synchronously on
/// socket close. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub user_id: String,
    pub session_id: String,
    pub config_id: Option<String>,
}

/// Audio parameters declared by the `session_settings` handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub channels: u16,
    /// Sample encoding label, e.g. `"linear16"`.
    pub encoding: String,
    pub sample_rate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            channels: 1,
            encoding: "linear16".to_string(),
            sample_rate: 44_100,
        }
    }
}

/// Frames accepted from clients over the relay WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// A chat message to persist and relay.
    #[serde(rename = "chat_message")]
    ChatMessage { content: String, role: MessageRole },
    /// Audio stream negotiation, sent before any `audio_input` frame.
    #[serde(rename = "session_settings")]
    SessionSettings { audio: AudioSettings },
    /// One base64-encoded block of linear16 PCM.
    #[serde(rename = "audio_input")]
    AudioInput { data: String, interim: bool },
    /// Free-form text input for the assistant.
    #[serde(rename = "user_input")]
    UserInput { text: String },
}

/// Frames emitted by the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Session metadata sent once, immediately after the upgrade completes.
    #[serde(rename = "chat_metadata")]
    ChatMetadata {
        chat_id: String,
        chat_group_id: String,
    },
    /// Acknowledges a persisted chat message back to the sender.
    #[serde(rename = "message_added")]
    MessageAdded { data: MessageAdded },
    /// A recoverable per-frame failure; the connection stays open.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Payload of [`ServerFrame::MessageAdded`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAdded {
    pub message_id: String,
    pub session_id: String,
    pub content: String,
    pub role: MessageRole,
}

/// Mints a fresh globally unique identifier for sessions, messages, and
/// connections. Collision probability is treated as zero.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
