// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-state and cross-device sync propagation.
//!
//! A `mark_read` advances the durable read pointer, settles the unread
//! counters, and publishes a `user.sync.{user}` event so the user's
//! sibling devices mirror the change; the originating session is
//! excluded at delivery. Focus advances the pointer to the channel's
//! latest event via the channel-latest pointer, never a history scan.

use std::sync::Arc;

use tracing::debug;

use pulse_core::bus::Bus;
use pulse_core::kv::{get_json, put_json, KvSet};
use pulse_core::record::{ChannelLatest, ReadPointer, UnreadCounters};
use pulse_core::store::MessageStore;
use pulse_core::sync::SyncEvent;
use pulse_core::{keys, now_ms, subject};

/// What a read pointer targets.
#[derive(Debug, Clone)]
pub enum ReadTarget {
    Channel(String),
    Thread(String),
}

pub struct ReadState {
    kv: KvSet,
    bus: Arc<dyn Bus>,
    store: Arc<dyn MessageStore>,
}

impl ReadState {
    pub fn new(kv: KvSet, bus: Arc<dyn Bus>, store: Arc<dyn MessageStore>) -> Self {
        Self { kv, bus, store }
    }

    /// Advance the read pointer and settle unread counters.
    ///
    /// `seq` is the log sequence of the acknowledged event as echoed by
    /// the client (0 when unknown). When the channel has newer events
    /// than the acknowledged one, the remaining unread count is
    /// recomputed from the message store instead of zeroed.
    pub async fn mark_read(
        &self,
        user: &str,
        origin_session: &str,
        target: ReadTarget,
        event_id: &str,
        seq: u64,
    ) -> anyhow::Result<()> {
        let pointer = ReadPointer { event_id: event_id.to_owned(), seq, ts_ms: now_ms() };
        let (key, sync) = match &target {
            ReadTarget::Channel(channel) => (
                keys::read_pointer(user, channel),
                SyncEvent::Read {
                    channel: Some(channel.clone()),
                    thread: None,
                    event_id: event_id.to_owned(),
                },
            ),
            ReadTarget::Thread(thread) => (
                keys::thread_read_pointer(user, thread),
                SyncEvent::Read {
                    thread: Some(thread.clone()),
                    channel: None,
                    event_id: event_id.to_owned(),
                },
            ),
        };
        put_json(self.kv.durable.as_ref(), &key, &pointer).await?;

        if let ReadTarget::Channel(channel) = &target {
            self.settle_unread(user, channel, event_id, seq).await?;
        }

        self.publish_sync(user, origin_session, sync).await?;
        Ok(())
    }

    /// Focus auto-read: advance to the channel's newest event.
    pub async fn focus_advance(
        &self,
        user: &str,
        origin_session: &str,
        channel: &str,
    ) -> anyhow::Result<()> {
        let latest =
            get_json::<ChannelLatest>(self.kv.durable.as_ref(), &keys::channel_latest(channel))
                .await?;
        match latest {
            Some(latest) if !latest.event_id.is_empty() => {
                self.mark_read(
                    user,
                    origin_session,
                    ReadTarget::Channel(channel.to_owned()),
                    &latest.event_id,
                    latest.seq,
                )
                .await
            }
            _ => Ok(()),
        }
    }

    /// Relay a draft change to sibling devices.
    pub async fn draft(
        &self,
        user: &str,
        origin_session: &str,
        channel: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        self.publish_sync(
            user,
            origin_session,
            SyncEvent::Draft { channel: channel.to_owned(), text: text.to_owned() },
        )
        .await
    }

    pub async fn unread_counters(&self, user: &str) -> anyhow::Result<UnreadCounters> {
        Ok(get_json(self.kv.durable.as_ref(), &keys::unread(user)).await?.unwrap_or_default())
    }

    pub async fn read_pointer(
        &self,
        user: &str,
        channel: &str,
    ) -> anyhow::Result<Option<ReadPointer>> {
        get_json(self.kv.durable.as_ref(), &keys::read_pointer(user, channel)).await
    }

    /// Zero or recount one channel's unread counter, then emit a badge
    /// sync so background devices can update.
    async fn settle_unread(
        &self,
        user: &str,
        channel: &str,
        event_id: &str,
        seq: u64,
    ) -> anyhow::Result<()> {
        let key = keys::unread(user);
        let mut counters: UnreadCounters =
            get_json(self.kv.durable.as_ref(), &key).await?.unwrap_or_default();

        let latest =
            get_json::<ChannelLatest>(self.kv.durable.as_ref(), &keys::channel_latest(channel))
                .await?;
        let behind = match &latest {
            Some(latest) => latest.seq > seq && latest.event_id != event_id,
            None => false,
        };

        if behind && seq > 0 {
            // Events newer than the acknowledged one stay unread.
            let remaining = self.store.messages_since(channel, seq, 1024).await?.len() as u64;
            let old = counters.channels.get(channel).copied().unwrap_or(0);
            counters.total = counters.total.saturating_sub(old) + remaining;
            if remaining == 0 {
                counters.channels.remove(channel);
            } else {
                counters.channels.insert(channel.to_owned(), remaining);
            }
        } else {
            counters.clear_channel(channel);
        }
        if counters.total == 0 {
            counters.mentions = 0;
        }
        put_json(self.kv.durable.as_ref(), &key, &counters).await?;

        // Badge follows the totals.
        self.publish_sync(
            user,
            "",
            SyncEvent::Badge { total: counters.total, mentions: counters.mentions },
        )
        .await?;
        Ok(())
    }

    async fn publish_sync(
        &self,
        user: &str,
        origin_session: &str,
        event: SyncEvent,
    ) -> anyhow::Result<()> {
        let envelope = event.into_envelope(
            uuid::Uuid::new_v4().to_string(),
            user,
            origin_session,
            now_ms(),
        )?;
        let payload = serde_json::to_vec(&envelope)?;
        if let Err(e) = self.bus.publish(&subject::user_sync(user), payload.into()).await {
            debug!(user, "sync publish failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "readstate_tests.rs"]
mod tests;
