// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client wire protocol — framed JSON over the WebSocket, both directions.
//!
//! Messages use internally-tagged JSON enums (`{"type": "mark_read", ...}`).
//! Two top-level enums cover client-to-server and server-to-client.

use serde::{Deserialize, Serialize};

use crate::envelope::EventEnvelope;

/// Per-device client state, ordered by the presence lattice
/// (active > idle > background).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Background,
    Idle,
    Active,
}

/// Aggregated user presence as reported to other users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Offline,
    Away,
    Idle,
    Online,
}

/// Messages a client sends to the notification server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Refresh presence TTL; report client state and focused channel.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        state: ClientState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        focused_channel: Option<String>,
    },
    #[serde(rename = "channel.focus")]
    ChannelFocus { channel: String },
    #[serde(rename = "channel.blur")]
    ChannelBlur { channel: String },
    /// Advance the read pointer for a channel or a followed thread.
    /// `seq` echoes the acknowledged event's log sequence when the
    /// client knows it (0 otherwise); it sharpens unread recounts.
    #[serde(rename = "mark_read")]
    MarkRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        event_id: String,
        #[serde(default)]
        seq: u64,
    },
    #[serde(rename = "typing.start")]
    TypingStart { channel: String },
    #[serde(rename = "typing.stop")]
    TypingStop { channel: String },
    /// One-time token exchange; consumed at handshake only.
    #[serde(rename = "ws_auth")]
    WsAuth { token: String },
    /// Initiate reconnection catchup.
    #[serde(rename = "sync.request")]
    SyncRequest { last_event_seq: u64, disconnected_at_ms: u64 },
    /// Cross-device draft replication.
    #[serde(rename = "draft.update")]
    DraftUpdate { channel: String, text: String },
}

/// One channel's line in a `sync.unread` summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadEntry {
    pub channel: String,
    pub unread: bool,
    pub unread_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sender: Option<String>,
}

/// Messages the notification server sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth.ok")]
    AuthOk { session_id: String },
    #[serde(rename = "message.new")]
    MessageNew { event: EventEnvelope },
    #[serde(rename = "message.edited")]
    MessageEdited { event: EventEnvelope },
    #[serde(rename = "message.deleted")]
    MessageDeleted { event: EventEnvelope },
    #[serde(rename = "message.reaction")]
    MessageReaction { event: EventEnvelope },
    #[serde(rename = "thread.reply")]
    ThreadReply { event: EventEnvelope },
    #[serde(rename = "thread.updated")]
    ThreadUpdated { event: EventEnvelope },
    #[serde(rename = "typing")]
    Typing { channel: String, user: String, active: bool, ts_ms: u64 },
    #[serde(rename = "presence")]
    Presence { user: String, state: PresenceState, ts_ms: u64 },
    /// Catchup plan: tier chosen and rough size, sent before any batch.
    #[serde(rename = "sync.plan")]
    SyncPlan { tier: u8, estimated_events: u64, channels: u32 },
    /// One channel's missed events, ordered by log sequence.
    #[serde(rename = "sync.batch")]
    SyncBatch { channel: String, events: Vec<EventEnvelope> },
    #[serde(rename = "sync.unread")]
    SyncUnread { entries: Vec<UnreadEntry>, total: u64, mentions: u64 },
    #[serde(rename = "sync.complete")]
    SyncComplete { last_event_seq: u64 },
    /// Read pointer moved on a sibling device.
    #[serde(rename = "sync.read")]
    SyncRead {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        event_id: String,
    },
    /// Draft updated on a sibling device.
    #[serde(rename = "sync.draft")]
    SyncDraft { channel: String, text: String },
    /// Server-initiated close; always precedes the socket close.
    #[serde(rename = "session.terminated")]
    SessionTerminated { reason: String },
}

impl ServerFrame {
    /// Wrap a channel-event envelope in the matching frame, or `None` for
    /// kinds that do not map to a direct delivery frame.
    pub fn from_envelope(event: EventEnvelope) -> Option<Self> {
        use crate::envelope::EventKind as K;
        match event.kind {
            K::MessageNew => Some(Self::MessageNew { event }),
            K::MessageEdited => Some(Self::MessageEdited { event }),
            K::MessageDeleted => Some(Self::MessageDeleted { event }),
            K::MessageReaction => Some(Self::MessageReaction { event }),
            K::ThreadReply => Some(Self::ThreadReply { event }),
            K::ThreadUpdated => Some(Self::ThreadUpdated { event }),
            K::Typing => {
                let active = event.payload.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
                Some(Self::Typing {
                    channel: event.channel_id.unwrap_or_default(),
                    user: event.author.unwrap_or_default(),
                    active,
                    ts_ms: event.ts_ms,
                })
            }
            K::Presence => {
                let state = serde_json::from_value(
                    event.payload.get("state").cloned().unwrap_or_default(),
                )
                .unwrap_or(PresenceState::Offline);
                Some(Self::Presence {
                    user: event.author.unwrap_or_default(),
                    state,
                    ts_ms: event.ts_ms,
                })
            }
            // Membership and sync events are consumed by the server side,
            // never forwarded verbatim.
            K::MemberJoin | K::MemberLeave | K::UserSync => None,
        }
    }

    /// Frames that may be dropped first when a session queue overflows.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Typing { .. } | Self::Presence { .. })
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
