// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconnection engine — tiered catchup after a disconnect.
//!
//! The tier is chosen from the client-reported gap, upper-bound
//! exclusive: a gap of exactly the T1 bound selects T2.
//!
//! | Tier | Source | Delivery |
//! |---|---|---|
//! | T1 | durable log replay | per-channel `sync.batch` |
//! | T2 | message store scans of the active-channel set | `sync.batch` + unread summary |
//! | T3 | channel-latest + read pointers | `sync.unread` only |
//! | T4 | top-N active channels | unread flags only |
//!
//! A slow store degrades only the affected channel to unread-only; a
//! whole-catchup deadline is enforced by the caller. The engine also
//! owns the per-user reconnect checkpoint record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use pulse_core::bus::Bus;
use pulse_core::envelope::EventEnvelope;
use pulse_core::frame::{ServerFrame, UnreadEntry};
use pulse_core::kv::{get_json, put_json, KvSet};
use pulse_core::record::{ChannelLatest, ClientStateRecord, UnreadCounters};
use pulse_core::store::{MembershipSource, MessageStore};
use pulse_core::{keys, now_ms};

const REPLAY_PAGE: usize = 512;

#[derive(Debug, Clone)]
pub struct CatchupConfig {
    pub t1_max_gap: Duration,
    pub t2_max_gap: Duration,
    pub t3_max_gap: Duration,
    pub active_channel_cap: usize,
    pub scan_concurrency: usize,
    /// Per-channel event cap for T1/T2 batches.
    pub batch_limit: usize,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            t1_max_gap: Duration::from_secs(120),
            t2_max_gap: Duration::from_secs(3600),
            t3_max_gap: Duration::from_secs(86_400),
            active_channel_cap: 50,
            scan_concurrency: 50,
            batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    T1,
    T2,
    T3,
    T4,
}

impl Tier {
    pub fn number(self) -> u8 {
        match self {
            Self::T1 => 1,
            Self::T2 => 2,
            Self::T3 => 3,
            Self::T4 => 4,
        }
    }
}

/// Select the catchup tier for a disconnect gap. Bounds are
/// upper-exclusive for the lower tier.
pub fn select_tier(gap: Duration, config: &CatchupConfig) -> Tier {
    if gap < config.t1_max_gap {
        Tier::T1
    } else if gap < config.t2_max_gap {
        Tier::T2
    } else if gap < config.t3_max_gap {
        Tier::T3
    } else {
        Tier::T4
    }
}

pub struct CatchupEngine {
    bus: Arc<dyn Bus>,
    kv: KvSet,
    store: Arc<dyn MessageStore>,
    membership: Arc<dyn MembershipSource>,
    config: CatchupConfig,
}

impl CatchupEngine {
    pub fn new(
        bus: Arc<dyn Bus>,
        kv: KvSet,
        store: Arc<dyn MessageStore>,
        membership: Arc<dyn MembershipSource>,
        config: CatchupConfig,
    ) -> Self {
        Self { bus, kv, store, membership, config }
    }

    /// Compute the full catchup frame sequence for a `sync.request`:
    /// `sync.plan`, then batches and/or an unread summary, then
    /// `sync.complete` carrying the new delivery position.
    pub async fn run(
        &self,
        user: &str,
        last_event_seq: u64,
        disconnected_at_ms: u64,
    ) -> anyhow::Result<Vec<ServerFrame>> {
        let gap = Duration::from_millis(now_ms().saturating_sub(disconnected_at_ms));
        let tier = select_tier(gap, &self.config);
        debug!(user, tier = tier.number(), gap_secs = gap.as_secs(), "catchup starting");
        metrics::counter!("pulse_catchup_total", "tier" => tier.number().to_string())
            .increment(1);

        let new_seq = self.bus.log_head().await.unwrap_or(last_event_seq).max(last_event_seq);
        let mut frames = match tier {
            Tier::T1 => self.tier1(user, last_event_seq).await?,
            Tier::T2 => self.tier2(user, last_event_seq).await?,
            Tier::T3 => self.tier3(user).await?,
            Tier::T4 => self.tier4(user).await?,
        };
        frames.push(ServerFrame::SyncComplete { last_event_seq: new_seq });
        Ok(frames)
    }

    /// T1: replay the durable log from the client's last sequence,
    /// filtered to the user's channels.
    async fn tier1(&self, user: &str, last_event_seq: u64) -> anyhow::Result<Vec<ServerFrame>> {
        let channels: std::collections::HashSet<String> =
            self.membership.channels_for_user(user).await?.into_iter().collect();

        let mut per_channel: Vec<(String, Vec<EventEnvelope>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut cursor = last_event_seq;
        let mut total = 0u64;

        loop {
            let page = self.bus.log_replay(cursor, REPLAY_PAGE).await?;
            let Some(last) = page.last() else { break };
            let next_cursor = last.seq;
            for envelope in page {
                if envelope.kind.is_ephemeral() || ServerFrame::from_envelope(envelope.clone()).is_none() {
                    continue;
                }
                let Some(channel) = envelope.channel_id.clone() else { continue };
                if !channels.contains(&channel) {
                    continue;
                }
                let slot = *index.entry(channel.clone()).or_insert_with(|| {
                    per_channel.push((channel.clone(), Vec::new()));
                    per_channel.len() - 1
                });
                if per_channel[slot].1.len() < self.config.batch_limit {
                    per_channel[slot].1.push(envelope);
                    total += 1;
                }
            }
            if next_cursor <= cursor {
                break;
            }
            cursor = next_cursor;
        }

        let mut frames = vec![ServerFrame::SyncPlan {
            tier: 1,
            estimated_events: total,
            channels: per_channel.len() as u32,
        }];
        for (channel, events) in per_channel {
            frames.push(ServerFrame::SyncBatch { channel, events });
        }
        Ok(frames)
    }

    /// T2: parallel store scans over the active-channel set, capped by
    /// the scan concurrency; everything else gets the unread summary.
    async fn tier2(&self, user: &str, last_event_seq: u64) -> anyhow::Result<Vec<ServerFrame>> {
        let all_channels = self.membership.channels_for_user(user).await?;
        let active = self.active_channels(user, &all_channels).await;

        let scans: Vec<(String, anyhow::Result<Vec<EventEnvelope>>)> =
            stream::iter(active.clone().into_iter().map(|channel| {
                let store = Arc::clone(&self.store);
                let limit = self.config.batch_limit;
                async move {
                    let result = store.messages_since(&channel, last_event_seq, limit).await;
                    (channel, result)
                }
            }))
            .buffer_unordered(self.config.scan_concurrency.max(1))
            .collect()
            .await;

        let mut batches = Vec::new();
        let mut degraded = Vec::new();
        let mut total = 0u64;
        for (channel, result) in scans {
            match result {
                Ok(events) if events.is_empty() => {}
                Ok(events) => {
                    total += events.len() as u64;
                    batches.push(ServerFrame::SyncBatch { channel, events });
                }
                Err(e) => {
                    // Store trouble degrades this channel to unread-only;
                    // the others are unaffected.
                    warn!(channel = %channel, err = %e, "tier-2 scan failed, degrading");
                    degraded.push(channel);
                }
            }
        }

        let mut summary_channels: Vec<String> = all_channels
            .iter()
            .filter(|c| !active.contains(*c))
            .cloned()
            .collect();
        summary_channels.extend(degraded);
        let (entries, counters) = self.unread_entries(user, &summary_channels).await?;

        let mut frames = vec![ServerFrame::SyncPlan {
            tier: 2,
            estimated_events: total,
            channels: batches.len() as u32,
        }];
        frames.extend(batches);
        if !entries.is_empty() {
            frames.push(ServerFrame::SyncUnread {
                entries,
                total: counters.total,
                mentions: counters.mentions,
            });
        }
        Ok(frames)
    }

    /// T3: unread summary only, no message bodies.
    async fn tier3(&self, user: &str) -> anyhow::Result<Vec<ServerFrame>> {
        let channels = self.membership.channels_for_user(user).await?;
        let (entries, counters) = self.unread_entries(user, &channels).await?;
        Ok(vec![
            ServerFrame::SyncPlan { tier: 3, estimated_events: 0, channels: 0 },
            ServerFrame::SyncUnread {
                entries,
                total: counters.total,
                mentions: counters.mentions,
            },
        ])
    }

    /// T4: full-refresh handoff — unread flags for the top active
    /// channels; the client loads the rest on demand from the read side.
    async fn tier4(&self, user: &str) -> anyhow::Result<Vec<ServerFrame>> {
        let all_channels = self.membership.channels_for_user(user).await?;
        let top = self.active_channels(user, &all_channels).await;
        let (entries, counters) = self.unread_entries(user, &top).await?;
        Ok(vec![
            ServerFrame::SyncPlan { tier: 4, estimated_events: 0, channels: 0 },
            ServerFrame::SyncUnread {
                entries,
                total: counters.total,
                mentions: counters.mentions,
            },
        ])
    }

    /// The user's active-channel set: most-recently-focused first from
    /// the checkpoint record, capped. Channels outside it get unread-only
    /// treatment regardless of how few are tracked. A user with no
    /// tracked focus history (fresh device) falls back to membership.
    async fn active_channels(&self, user: &str, all_channels: &[String]) -> Vec<String> {
        let record = get_json::<ClientStateRecord>(
            self.kv.sessions.as_ref(),
            &keys::client_state(user),
        )
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

        let mut active = record.active_channels;
        active.retain(|c| all_channels.contains(c));
        if active.is_empty() {
            active = all_channels.to_vec();
        }
        active.truncate(self.config.active_channel_cap);
        active
    }

    /// Unread summary lines for the given channels, from the counters
    /// and channel-latest pointers.
    async fn unread_entries(
        &self,
        user: &str,
        channels: &[String],
    ) -> anyhow::Result<(Vec<UnreadEntry>, UnreadCounters)> {
        let counters: UnreadCounters = get_json(self.kv.durable.as_ref(), &keys::unread(user))
            .await?
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(channels.len());
        for channel in channels {
            let unread_count = counters.channels.get(channel).copied().unwrap_or(0);
            let latest = get_json::<ChannelLatest>(
                self.kv.durable.as_ref(),
                &keys::channel_latest(channel),
            )
            .await
            .unwrap_or(None);
            entries.push(UnreadEntry {
                channel: channel.clone(),
                unread: unread_count > 0,
                unread_count,
                last_message_at_ms: latest.as_ref().map(|l| l.ts_ms),
                last_sender: latest.and_then(|l| l.sender),
            });
        }
        Ok((entries, counters))
    }

    // -- checkpointing -------------------------------------------------------

    /// Record the delivery position for `user`. Called periodically, on
    /// a delivered-event threshold, and finally on clean disconnect.
    pub async fn checkpoint(&self, user: &str, last_event_seq: u64) -> anyhow::Result<()> {
        let key = keys::client_state(user);
        let mut record = get_json::<ClientStateRecord>(self.kv.sessions.as_ref(), &key)
            .await?
            .unwrap_or_default();
        record.last_event_seq = record.last_event_seq.max(last_event_seq);
        record.updated_ms = now_ms();
        put_json(self.kv.sessions.as_ref(), &key, &record).await
    }

    /// Record a channel focus in the active-channel LRU.
    pub async fn touch_active_channel(&self, user: &str, channel: &str) -> anyhow::Result<()> {
        let key = keys::client_state(user);
        let mut record = get_json::<ClientStateRecord>(self.kv.sessions.as_ref(), &key)
            .await?
            .unwrap_or_default();
        record.touch_channel(channel, self.config.active_channel_cap);
        record.updated_ms = now_ms();
        put_json(self.kv.sessions.as_ref(), &key, &record).await
    }
}

#[cfg(test)]
#[path = "catchup_tests.rs"]
mod tests;
