// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event envelope — the unit that moves from the durable log through the
//! fan-out router to per-instance inboxes.
//!
//! The payload is opaque to the core; routing works off the metadata
//! fields only. `seq` is the log-stream sequence and is assigned by the
//! bus, not the producer: drivers overwrite it from stream metadata at
//! pull time.

use serde::{Deserialize, Serialize};

/// Event kinds carried through the fan-out path.
///
/// Wire names match the dotted client-protocol tags so an envelope kind
/// maps 1:1 onto the server frame a session receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message.new")]
    MessageNew,
    #[serde(rename = "message.edited")]
    MessageEdited,
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    #[serde(rename = "message.reaction")]
    MessageReaction,
    #[serde(rename = "thread.reply")]
    ThreadReply,
    #[serde(rename = "thread.updated")]
    ThreadUpdated,
    #[serde(rename = "typing")]
    Typing,
    #[serde(rename = "presence")]
    Presence,
    #[serde(rename = "member.join")]
    MemberJoin,
    #[serde(rename = "member.leave")]
    MemberLeave,
    #[serde(rename = "user.sync")]
    UserSync,
}

impl EventKind {
    /// Ephemeral kinds may be dropped under backpressure and are excluded
    /// from catchup replay.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Typing | Self::Presence)
    }

    /// Kinds whose origin instance must not receive the fan-out echo.
    pub fn excludes_origin(self) -> bool {
        matches!(self, Self::Typing | Self::Presence)
    }

    /// Kinds that count toward per-channel unread totals.
    pub fn counts_unread(self) -> bool {
        matches!(self, Self::MessageNew | Self::ThreadReply)
    }
}

/// Metadata wrapper around an opaque event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique event id; receivers dedup on it.
    pub event_id: String,
    /// Log-stream sequence, monotonic per stream. Zero until assigned.
    #[serde(default)]
    pub seq: u64,
    pub kind: EventKind,
    /// Empty for user-scoped events (sync, presence).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Set for typing/presence so the origin instance can be excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_instance: Option<String>,
    /// Set for sync events so sibling devices can skip the originator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// For thread replies: also broadcast to the parent channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub also_send_to_channel: Option<bool>,
    pub ts_ms: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Routing key for user-scoped events: the target user id.
    ///
    /// Sync events are addressed by author; presence changes by the user
    /// whose presence changed (also carried in `author`).
    pub fn target_user(&self) -> Option<&str> {
        match self.kind {
            EventKind::UserSync | EventKind::Presence => self.author.as_deref(),
            _ => None,
        }
    }
}

/// Coalesced per-instance publish payload.
///
/// The fan-out router batches envelopes targeting the same instance
/// within the batch window into one publish, preserving per-channel
/// order inside `envelopes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBatch {
    pub envelopes: Vec<EventEnvelope>,
}

impl EnvelopeBatch {
    pub fn single(envelope: EventEnvelope) -> Self {
        Self { envelopes: vec![envelope] }
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
