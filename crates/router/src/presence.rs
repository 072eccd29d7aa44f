// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Presence tracker — turns presence broadcasts and KV expiries into
//! routing-table mutations.
//!
//! The primary signal is the `presence.changed.{user}` broadcast each
//! notification server emits; the KV watch on the presence bucket is the
//! backstop that catches crashed instances via TTL expiry. Broadcasts
//! can arrive out of order, so each carries a per-user monotonic
//! sequence and stale updates are dropped by comparison. A KV outage
//! leaves the table routing on its last known state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_core::bus::Bus;
use pulse_core::envelope::{EnvelopeBatch, EventEnvelope, EventKind};
use pulse_core::kv::{get_json, Kv};
use pulse_core::record::{PresenceChange, PresenceRecord};
use pulse_core::subject;

use crate::membership::MembershipCache;
use crate::routing::RoutingTable;

pub struct PresenceTracker {
    table: Arc<RoutingTable>,
    cache: Arc<MembershipCache>,
    bus: Arc<dyn Bus>,
    last_seq: Mutex<HashMap<String, u64>>,
}

impl PresenceTracker {
    pub fn new(
        table: Arc<RoutingTable>,
        cache: Arc<MembershipCache>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self { table, cache, bus, last_seq: Mutex::new(HashMap::new()) }
    }

    /// Spawn the tracker loop as a background task.
    pub fn spawn(
        self: Arc<Self>,
        presence_kv: Arc<dyn Kv>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(presence_kv, shutdown).await {
                tracing::error!(err = %e, "presence tracker failed");
            }
        })
    }

    async fn run(
        self: Arc<Self>,
        presence_kv: Arc<dyn Kv>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut changes = self.bus.subscribe(subject::PRESENCE_WILDCARD).await?;
        let mut expiries = presence_kv.watch("presence:user:").await?;
        info!("presence tracker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = changes.recv() => {
                    let Some(msg) = msg else { break };
                    let change: PresenceChange = match serde_json::from_slice(&msg.payload) {
                        Ok(c) => c,
                        Err(e) => {
                            debug!("invalid presence change: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_change(change).await {
                        warn!(err = %e, "presence change handling failed");
                    }
                }
                entry = expiries.recv() => {
                    let Some(entry) = entry else { continue };
                    if entry.value.is_some() {
                        // Puts are covered by the broadcast path.
                        continue;
                    }
                    if let Some(user) = entry.key.strip_prefix("presence:user:") {
                        info!(user, "presence TTL expiry, clearing routing");
                        self.handle_expiry(user).await;
                    }
                }
            }
        }

        info!("presence tracker stopped");
        Ok(())
    }

    /// Apply one presence broadcast: sequence-gate, mutate the table,
    /// and fan the presence event to interested instances.
    pub async fn handle_change(&self, change: PresenceChange) -> anyhow::Result<()> {
        {
            let mut last = self.last_seq.lock().await;
            let entry = last.entry(change.user.clone()).or_insert(0);
            if change.seq <= *entry {
                metrics::counter!("pulse_presence_stale_dropped_total").increment(1);
                debug!(user = %change.user, seq = change.seq, "stale presence update dropped");
                return Ok(());
            }
            *entry = change.seq;
        }
        metrics::counter!("pulse_presence_changes_total").increment(1);

        // Interested channels, captured before any teardown so an
        // offline transition can still be announced.
        let channels: HashSet<String> = {
            let routed = self.table.user_channels(&change.user);
            if routed.is_empty() {
                match self.cache.channels_for_user(&change.user).await {
                    Ok(set) => set.as_ref().clone(),
                    Err(_) => HashSet::new(),
                }
            } else {
                routed
            }
        };

        if change.instance_online {
            self.cache.pin_user(&change.user).await;
            let membership = self.cache.channels_for_user(&change.user).await?;
            let membership: Vec<String> = membership.iter().cloned().collect();
            self.table.add_presence(&change.user, &change.instance, &membership);
        } else {
            self.table.remove_presence_at(&change.user, &change.instance);
            if self.table.user_instances(&change.user).is_empty() {
                self.cache.unpin_user(&change.user).await;
            }
        }

        self.broadcast(&change, &channels).await;
        Ok(())
    }

    /// TTL expiry: the user's record aged out, clear all routing. The
    /// sequence gate resets too — a fresh record starts over at 1.
    pub async fn handle_expiry(&self, user: &str) {
        self.table.remove_presence(user);
        self.cache.unpin_user(user).await;
        self.last_seq.lock().await.remove(user);
    }

    /// Rebuild routing for the users recorded in the presence bucket.
    /// Run at startup and after a KV reconnect.
    pub async fn reconcile(&self, presence_kv: &dyn Kv) -> anyhow::Result<usize> {
        let keys = presence_kv.keys("presence:user:").await?;
        let mut restored = 0;
        for key in keys {
            let Some(record) = get_json::<PresenceRecord>(presence_kv, &key).await? else {
                continue;
            };
            self.last_seq.lock().await.insert(record.user.clone(), record.seq);
            for (instance, presence) in &record.instances {
                if presence.device_count == 0 {
                    continue;
                }
                self.cache.pin_user(&record.user).await;
                let membership = self.cache.channels_for_user(&record.user).await?;
                let membership: Vec<String> = membership.iter().cloned().collect();
                self.table.add_presence(&record.user, instance, &membership);
                restored += 1;
            }
        }
        info!(restored, "presence reconcile complete");
        Ok(restored)
    }

    /// Deliver a presence frame to every instance that shares a channel
    /// with the user, excluding the origin (its server already delivered
    /// locally).
    async fn broadcast(&self, change: &PresenceChange, channels: &HashSet<String>) {
        let mut targets: HashSet<String> = HashSet::new();
        for channel in channels {
            targets.extend(self.table.lookup(channel));
        }
        targets.remove(&change.instance);
        if targets.is_empty() {
            return;
        }

        let envelope = EventEnvelope {
            event_id: format!("pr-{}-{}", change.user, change.seq),
            seq: 0,
            kind: EventKind::Presence,
            channel_id: None,
            thread_id: None,
            origin_instance: Some(change.instance.clone()),
            origin_session: None,
            author: Some(change.user.clone()),
            also_send_to_channel: None,
            ts_ms: change.ts_ms,
            payload: serde_json::json!({ "state": change.state }),
        };
        let batch = EnvelopeBatch::single(envelope);
        let Ok(payload) = serde_json::to_vec(&batch) else {
            return;
        };
        for instance in targets {
            if let Err(e) = self
                .bus
                .publish(&subject::instance_events(&instance), payload.clone().into())
                .await
            {
                debug!(instance = %instance, "presence broadcast failed: {e}");
            }
        }
    }
}

#[cfg(test)]
#[path = "presence_tests.rs"]
mod tests;
