//! Canonical wire protocol for the ephemera relay.
//!
//! Frames are JSON text, one object per frame, discriminated by a `type`
//! field. Field names are camelCase on the wire. The relay never persists
//! any of this: typing events are forwarded, not retained.

use serde::{Deserialize, Serialize};

/// Maximum length of a composition text update, in characters. Longer
/// updates are dropped by the relay without disconnecting the sender.
pub const MAX_COMPOSITION_CHARS: usize = 1000;

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Identity handshake. Answered with [`ServerMessage::HelloAck`] to the
    /// sender only, carrying the server-assigned connection id.
    Hello,

    /// A new composition began. Relayed as a `typing_state` with empty text
    /// and sequence number 0.
    TypingStart { composition_id: String },

    /// Incremental composition text.
    TypingUpdate {
        composition_id: String,
        seq: u64,
        text: String,
    },

    /// Composition finished.
    TypingEnd {
        composition_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
}

/// A connected peer as listed in a presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: String,
}

/// Messages the relay sends to a client.
///
/// A `presence` snapshot is tailored per recipient: the `users` list holds
/// every currently-connected peer *except* the recipient itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Reply to [`ClientMessage::Hello`], sent to the sender only.
    HelloAck { user_id: String },

    /// Presence snapshot, redistributed on every membership change.
    Presence { users: Vec<PresenceUser> },

    /// A peer's in-progress composition changed.
    TypingState {
        from_user_id: String,
        composition_id: String,
        seq: u64,
        text: String,
        /// Epoch milliseconds, assigned by the relay.
        ts: i64,
    },

    /// A peer finished a composition.
    TypingEnd {
        from_user_id: String,
        composition_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_text: Option<String>,
        ts: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
}
