// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! KV record payloads shared between the router and the notifier.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::frame::{ClientState, PresenceState};

/// Per-(user, channel) read pointer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadPointer {
    pub event_id: String,
    /// Log sequence of the last-read event; drives empty-catchup checks.
    #[serde(default)]
    pub seq: u64,
    pub ts_ms: u64,
}

/// Per-channel newest-event pointer, maintained by the persistence side.
/// Read here for unread summaries without history scans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelLatest {
    pub event_id: String,
    #[serde(default)]
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Per-user unread counters: channel map plus aggregate totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnreadCounters {
    #[serde(default)]
    pub channels: HashMap<String, u64>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub mentions: u64,
}

impl UnreadCounters {
    /// Fan-out increment for one channel.
    pub fn bump(&mut self, channel: &str, mention: bool) {
        *self.channels.entry(channel.to_owned()).or_insert(0) += 1;
        self.total += 1;
        if mention {
            self.mentions += 1;
        }
    }

    /// Mark-read: zero one channel and settle the aggregate.
    pub fn clear_channel(&mut self, channel: &str) {
        if let Some(count) = self.channels.remove(channel) {
            self.total = self.total.saturating_sub(count);
        }
    }
}

/// Reconnect checkpoint, written periodically and on clean disconnect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientStateRecord {
    pub last_event_seq: u64,
    pub updated_ms: u64,
    /// Most-recently-focused channels, newest first, capped by config.
    #[serde(default)]
    pub active_channels: Vec<String>,
}

impl ClientStateRecord {
    /// Record a focus on `channel`, keeping LRU order under `cap`.
    pub fn touch_channel(&mut self, channel: &str, cap: usize) {
        self.active_channels.retain(|c| c != channel);
        self.active_channels.insert(0, channel.to_owned());
        self.active_channels.truncate(cap);
    }
}

/// Presence for one user on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePresence {
    pub device_count: u32,
    pub state: ClientState,
}

/// Aggregated per-user presence record (`presence:user:{id}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user: String,
    pub state: PresenceState,
    /// Monotonic update sequence; stale writes lose by comparison.
    pub seq: u64,
    pub device_count: u32,
    pub last_active_ms: u64,
    #[serde(default)]
    pub instances: BTreeMap<String, InstancePresence>,
}

impl PresenceRecord {
    /// Fold per-instance device states into the aggregate lattice:
    /// any active device → online, else any idle → idle, else any
    /// background → away, none → offline.
    pub fn aggregate(instances: &BTreeMap<String, InstancePresence>) -> PresenceState {
        let mut best: Option<ClientState> = None;
        for p in instances.values() {
            if p.device_count == 0 {
                continue;
            }
            best = Some(match best {
                Some(b) if b >= p.state => b,
                _ => p.state,
            });
        }
        match best {
            Some(ClientState::Active) => PresenceState::Online,
            Some(ClientState::Idle) => PresenceState::Idle,
            Some(ClientState::Background) => PresenceState::Away,
            None => PresenceState::Offline,
        }
    }
}

/// Broadcast payload on `presence.changed.{user}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceChange {
    pub user: String,
    /// Instance whose local view changed.
    pub instance: String,
    /// Aggregate state after the change; `offline` at this instance means
    /// the routing entries for (user, instance) can go.
    pub state: PresenceState,
    pub instance_online: bool,
    pub seq: u64,
    pub ts_ms: u64,
}

/// Instance registration record (`instance:{id}`), TTL-expired on crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance: String,
    pub started_ms: u64,
    pub sessions: u32,
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
