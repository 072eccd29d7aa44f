// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Downstream store capability surfaces: the membership source (metadata
//! store) and the message store (column store scanned by T2 catchup).
//!
//! Both are read-only from the core's point of view. The in-memory
//! fakes double as the test fixtures; `MemMessageStore` can simulate a
//! per-channel outage to exercise the unread-only degrade path.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::envelope::EventEnvelope;

/// Authoritative membership queries against the metadata store.
#[async_trait]
pub trait MembershipSource: Send + Sync + 'static {
    async fn channels_for_user(&self, user: &str) -> anyhow::Result<Vec<String>>;
    async fn members_of_channel(&self, channel: &str) -> anyhow::Result<Vec<String>>;
    async fn thread_followers(&self, thread: &str) -> anyhow::Result<Vec<String>>;
}

/// Historical message reads for T2 catchup.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Events for `channel` with `seq > after_seq`, ascending, capped at
    /// `limit`.
    async fn messages_since(
        &self,
        channel: &str,
        after_seq: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<EventEnvelope>>;
}

#[derive(Default)]
struct DirectoryState {
    channels_by_user: HashMap<String, HashSet<String>>,
    users_by_channel: HashMap<String, HashSet<String>>,
    followers_by_thread: HashMap<String, HashSet<String>>,
}

/// In-memory membership directory.
#[derive(Default)]
pub struct MemDirectory {
    state: RwLock<DirectoryState>,
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, user: &str, channel: &str) {
        let mut state = self.state.write().await;
        state.channels_by_user.entry(user.to_owned()).or_default().insert(channel.to_owned());
        state.users_by_channel.entry(channel.to_owned()).or_default().insert(user.to_owned());
    }

    pub async fn leave(&self, user: &str, channel: &str) {
        let mut state = self.state.write().await;
        if let Some(channels) = state.channels_by_user.get_mut(user) {
            channels.remove(channel);
        }
        if let Some(users) = state.users_by_channel.get_mut(channel) {
            users.remove(user);
        }
    }

    pub async fn follow(&self, user: &str, thread: &str) {
        let mut state = self.state.write().await;
        state.followers_by_thread.entry(thread.to_owned()).or_default().insert(user.to_owned());
    }
}

#[async_trait]
impl MembershipSource for MemDirectory {
    async fn channels_for_user(&self, user: &str) -> anyhow::Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.channels_by_user.get(user).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn members_of_channel(&self, channel: &str) -> anyhow::Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.users_by_channel.get(channel).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn thread_followers(&self, thread: &str) -> anyhow::Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .followers_by_thread
            .get(thread)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct MessageStoreState {
    by_channel: HashMap<String, Vec<EventEnvelope>>,
    failing: HashSet<String>,
}

/// In-memory message store.
#[derive(Default)]
pub struct MemMessageStore {
    state: RwLock<MessageStoreState>,
}

impl MemMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, envelope: EventEnvelope) {
        let Some(channel) = envelope.channel_id.clone() else {
            return;
        };
        let mut state = self.state.write().await;
        let events = state.by_channel.entry(channel).or_default();
        events.push(envelope);
        events.sort_by_key(|e| e.seq);
    }

    /// Make reads for `channel` fail, simulating a store outage.
    pub async fn set_failing(&self, channel: &str, failing: bool) {
        let mut state = self.state.write().await;
        if failing {
            state.failing.insert(channel.to_owned());
        } else {
            state.failing.remove(channel);
        }
    }
}

#[async_trait]
impl MessageStore for MemMessageStore {
    async fn messages_since(
        &self,
        channel: &str,
        after_seq: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<EventEnvelope>> {
        let state = self.state.read().await;
        if state.failing.contains(channel) {
            anyhow::bail!("message store unavailable for {channel}");
        }
        Ok(state
            .by_channel
            .get(channel)
            .map(|events| {
                events.iter().filter(|e| e.seq > after_seq).take(limit).cloned().collect()
            })
            .unwrap_or_default())
    }
}
