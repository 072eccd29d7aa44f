// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fan-out router — the performance-critical path.
//!
//! A pull loop fetches batches from the durable log and hands each event
//! to a worker shard chosen by channel-id hash, so one channel's events
//! are always serialized through one worker while different channels
//! proceed concurrently. Workers coalesce events targeting the same
//! instance within a short window into a single publish, then ack the
//! log only after every target publish for an event succeeded; failures
//! NAK for redelivery with exponential backoff (receivers dedup by
//! event id).
//!
//! Ephemeral traffic (typing, user-sync) bypasses the log: dedicated
//! subscription tasks route it directly, each single-tasked so per-key
//! order is preserved.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_core::bus::{Bus, PulledEvent};
use pulse_core::envelope::{EnvelopeBatch, EventEnvelope, EventKind};
use pulse_core::kv::{get_json, put_json, Kv};
use pulse_core::record::UnreadCounters;
use pulse_core::{keys, subject};

use crate::followers::FollowerCache;
use crate::membership::MembershipCache;
use crate::routing::RoutingTable;

const WORKER_QUEUE_DEPTH: usize = 512;
const MAX_COALESCE: usize = 128;
const IDLE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Log pull batch size.
    pub batch_size: usize,
    /// Coalescing window per worker.
    pub batch_window: Duration,
    /// Worker shard count (per-channel serial order within a shard).
    pub shards: usize,
    /// Durable consumer name on the events stream.
    pub consumer_name: String,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            batch_window: Duration::from_millis(1),
            shards: 8,
            consumer_name: "fanout".to_owned(),
        }
    }
}

/// Routing outcome for one envelope.
enum Routed {
    /// Publish to these instances.
    Deliver(Vec<String>),
    /// Consumed by the router itself (membership updates).
    Consumed,
    /// No interested instance right now; ack and leave it in the log
    /// for catchup replay.
    NoInterest,
}

pub struct FanOut {
    table: Arc<RoutingTable>,
    cache: Arc<MembershipCache>,
    followers: Arc<FollowerCache>,
    bus: Arc<dyn Bus>,
    /// Durable KV holding the per-user unread counters.
    unread_kv: Arc<dyn Kv>,
    /// Countable envelopes funnel through one task: counter updates are
    /// read-modify-write, and a user's counters can be touched from
    /// several channel shards.
    unread_tx: mpsc::Sender<EventEnvelope>,
    unread_rx: tokio::sync::Mutex<Option<mpsc::Receiver<EventEnvelope>>>,
    config: FanOutConfig,
}

impl FanOut {
    pub fn new(
        table: Arc<RoutingTable>,
        cache: Arc<MembershipCache>,
        followers: Arc<FollowerCache>,
        bus: Arc<dyn Bus>,
        unread_kv: Arc<dyn Kv>,
        config: FanOutConfig,
    ) -> Self {
        let (unread_tx, unread_rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        Self {
            table,
            cache,
            followers,
            bus,
            unread_kv,
            unread_tx,
            unread_rx: tokio::sync::Mutex::new(Some(unread_rx)),
            config,
        }
    }

    /// Run the pull loop, worker shards, and ephemeral routers until
    /// shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut consumer = self
            .bus
            .log_consumer(
                &self.config.consumer_name,
                &subject::LOG_FILTER_SUBJECTS.map(str::to_owned),
            )
            .await?;

        let shard_count = self.config.shards.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel::<PulledEvent>(WORKER_QUEUE_DEPTH);
            senders.push(tx);
            let this = Arc::clone(&self);
            let sd = shutdown.clone();
            workers.push(tokio::spawn(async move {
                this.worker(shard, rx, sd).await;
            }));
        }

        let typing_task = tokio::spawn(Arc::clone(&self).typing_loop(shutdown.clone()));
        let sync_task = tokio::spawn(Arc::clone(&self).user_sync_loop(shutdown.clone()));
        let unread_task = match self.unread_rx.lock().await.take() {
            Some(rx) => Some(tokio::spawn(Arc::clone(&self).unread_loop(rx, shutdown.clone()))),
            None => None,
        };

        info!(shards = shard_count, "fan-out router started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = consumer.fetch(self.config.batch_size) => batch,
            };
            match batch {
                Ok(batch) if batch.is_empty() => {
                    tokio::time::sleep(IDLE_POLL).await;
                }
                Ok(batch) => {
                    for event in batch {
                        let shard = shard_for(&event.envelope, shard_count);
                        // Bounded queues backpressure the pull rate.
                        if senders[shard].send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    // Log unreachable: delivery pauses, nothing is torn down.
                    warn!(err = %e, "log fetch failed, delivery paused");
                    metrics::counter!("pulse_fanout_log_errors_total").increment(1);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        drop(senders);
        for worker in workers {
            let _ = worker.await;
        }
        let _ = typing_task.await;
        let _ = sync_task.await;
        if let Some(task) = unread_task {
            let _ = task.await;
        }
        info!("fan-out router stopped");
        Ok(())
    }

    /// One worker shard: drain its queue with a coalescing window, then
    /// publish per-instance batches and settle acks.
    async fn worker(
        self: Arc<Self>,
        shard: usize,
        mut rx: mpsc::Receiver<PulledEvent>,
        shutdown: CancellationToken,
    ) {
        debug!(shard, "fan-out worker started");
        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };

            let mut pending = vec![first];
            let deadline = tokio::time::Instant::now() + self.config.batch_window;
            while pending.len() < MAX_COALESCE {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(event)) => pending.push(event),
                    _ => break,
                }
            }

            self.process(pending).await;
        }
        debug!(shard, "fan-out worker stopped");
    }

    /// Route, coalesce, publish, and ack one worker batch.
    async fn process(&self, events: Vec<PulledEvent>) {
        let mut deliverable: Vec<(PulledEvent, Vec<String>)> = Vec::new();

        for event in events {
            // Unread counters move on first delivery only; a NAK retry
            // must not double-count.
            if event.deliveries <= 1 && event.envelope.kind.counts_unread() {
                let _ = self.unread_tx.send(event.envelope.clone()).await;
            }
            match self.targets_for(&event.envelope).await {
                Ok(Routed::Deliver(targets)) => deliverable.push((event, targets)),
                Ok(Routed::Consumed) | Ok(Routed::NoInterest) => {
                    if let Err(e) = event.ack().await {
                        debug!("ack failed: {e}");
                    }
                }
                Err(e) => {
                    warn!(err = %e, "routing failed, requesting redelivery");
                    let delay = backoff(event.deliveries);
                    if let Err(e) = event.nak(Some(delay)).await {
                        debug!("nak failed: {e}");
                    }
                }
            }
        }

        // Coalesce into one publish per target instance, preserving the
        // per-channel arrival order.
        let mut order: Vec<String> = Vec::new();
        let mut batches: HashMap<String, Vec<EventEnvelope>> = HashMap::new();
        for (event, targets) in &deliverable {
            for instance in targets {
                if !batches.contains_key(instance) {
                    order.push(instance.clone());
                }
                batches.entry(instance.clone()).or_default().push(event.envelope.clone());
            }
        }

        let mut failed: HashSet<String> = HashSet::new();
        for instance in order {
            let Some(envelopes) = batches.remove(&instance) else {
                continue;
            };
            let count = envelopes.len() as u64;
            let batch = EnvelopeBatch { envelopes };
            let publish = serde_json::to_vec(&batch)
                .map_err(anyhow::Error::from)
                .map(bytes::Bytes::from);
            let result = match publish {
                Ok(payload) => {
                    self.bus.publish(&subject::instance_events(&instance), payload).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    metrics::counter!("pulse_fanout_publishes_total").increment(1);
                    metrics::counter!("pulse_fanout_events_published_total").increment(count);
                }
                Err(e) => {
                    warn!(instance = %instance, err = %e, "instance publish failed");
                    metrics::counter!("pulse_fanout_publish_errors_total").increment(1);
                    failed.insert(instance);
                }
            }
        }

        // Ack-after-publish: an event is settled only once every one of
        // its target instances got its batch.
        for (event, targets) in deliverable {
            if targets.iter().any(|t| failed.contains(t)) {
                let delay = backoff(event.deliveries);
                if let Err(e) = event.nak(Some(delay)).await {
                    debug!("nak failed: {e}");
                }
            } else if let Err(e) = event.ack().await {
                debug!("ack failed: {e}");
            }
        }
    }

    /// Compute the target instance set for one envelope.
    async fn targets_for(&self, envelope: &EventEnvelope) -> anyhow::Result<Routed> {
        match envelope.kind {
            EventKind::MemberJoin | EventKind::MemberLeave => {
                self.apply_membership(envelope).await;
                Ok(Routed::Consumed)
            }
            EventKind::ThreadReply => self.thread_targets(envelope).await,
            EventKind::UserSync => {
                let Some(user) = envelope.target_user() else {
                    return Ok(Routed::NoInterest);
                };
                let instances = self.table.user_instances(user);
                if instances.is_empty() {
                    Ok(Routed::NoInterest)
                } else {
                    Ok(Routed::Deliver(instances))
                }
            }
            _ => self.channel_targets(envelope).await,
        }
    }

    /// Channel events: routing-table lookup, with a membership-cache
    /// fallback when the table is empty for a channel that demonstrably
    /// has online members (an invariant violation worth shouting about).
    async fn channel_targets(&self, envelope: &EventEnvelope) -> anyhow::Result<Routed> {
        let Some(channel) = envelope.channel_id.as_deref() else {
            return Ok(Routed::NoInterest);
        };
        let mut targets: HashSet<String> = self.table.lookup(channel).into_iter().collect();

        if targets.is_empty() {
            let members = self.cache.members_of_channel(channel).await?;
            for member in members.iter() {
                targets.extend(self.table.user_instances(member));
            }
            if !targets.is_empty() {
                warn!(channel, "routing entry missing for channel with online members");
                metrics::counter!("pulse_routing_invariant_violations_total").increment(1);
            }
        }

        // Only echo kinds skip the origin instance; content kinds must
        // reach the author's own sessions too.
        if envelope.kind.excludes_origin() {
            if let Some(origin) = envelope.origin_instance.as_deref() {
                targets.remove(origin);
            }
        }
        if targets.is_empty() {
            Ok(Routed::NoInterest)
        } else {
            Ok(Routed::Deliver(targets.into_iter().collect()))
        }
    }

    /// Thread replies route to follower instances; when the reply is
    /// also sent to the channel, the channel's instance set is unioned in.
    async fn thread_targets(&self, envelope: &EventEnvelope) -> anyhow::Result<Routed> {
        let Some(thread) = envelope.thread_id.as_deref() else {
            // A thread reply without a thread id routes like a plain
            // channel message.
            return self.channel_targets(envelope).await;
        };
        let mut targets: HashSet<String> = HashSet::new();
        let followers = self.followers.followers(thread).await?;
        for follower in followers.iter() {
            targets.extend(self.table.user_instances(follower));
        }
        if envelope.also_send_to_channel.unwrap_or(false) {
            if let Some(channel) = envelope.channel_id.as_deref() {
                targets.extend(self.table.lookup(channel));
            }
        }
        // Thread replies are content, not echoes: the author's own
        // instance stays in the set so her session gets the reply back.
        if envelope.kind.excludes_origin() {
            if let Some(origin) = envelope.origin_instance.as_deref() {
                targets.remove(origin);
            }
        }
        if targets.is_empty() {
            Ok(Routed::NoInterest)
        } else {
            Ok(Routed::Deliver(targets.into_iter().collect()))
        }
    }

    /// Drain the unread funnel; single-tasked so counter writes never
    /// race each other.
    async fn unread_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<EventEnvelope>,
        shutdown: CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(e) => e,
                    None => break,
                },
            };
            self.bump_unread(&envelope).await;
        }
    }

    /// Increment unread counters for every recipient of a countable
    /// event, online or not; tier-3 summaries and badges read these.
    async fn bump_unread(&self, envelope: &EventEnvelope) {
        if !envelope.kind.counts_unread() {
            return;
        }
        let Some(channel) = envelope.channel_id.as_deref() else {
            return;
        };

        let followers_only = envelope.kind == EventKind::ThreadReply
            && !envelope.also_send_to_channel.unwrap_or(false);
        let recipients: Vec<String> = if followers_only {
            match envelope.thread_id.as_deref() {
                Some(thread) => match self.followers.followers(thread).await {
                    Ok(set) => set.iter().cloned().collect(),
                    Err(e) => {
                        debug!(thread, "follower lookup for unread failed: {e}");
                        return;
                    }
                },
                None => return,
            }
        } else {
            match self.cache.members_of_channel(channel).await {
                Ok(set) => set.iter().cloned().collect(),
                Err(e) => {
                    debug!(channel, "member lookup for unread failed: {e}");
                    return;
                }
            }
        };

        let mentioned: HashSet<&str> = envelope
            .payload
            .get("mentions")
            .and_then(|m| m.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        for user in recipients {
            if envelope.author.as_deref() == Some(user.as_str()) {
                continue;
            }
            let key = keys::unread(&user);
            let mut counters: UnreadCounters =
                match get_json(self.unread_kv.as_ref(), &key).await {
                    Ok(counters) => counters.unwrap_or_default(),
                    Err(e) => {
                        debug!(user = %user, "unread read failed: {e}");
                        continue;
                    }
                };
            counters.bump(channel, mentioned.contains(user.as_str()));
            if let Err(e) = put_json(self.unread_kv.as_ref(), &key, &counters).await {
                debug!(user = %user, "unread write failed: {e}");
            }
        }
    }

    /// Membership events mutate the cache and the routing table; they
    /// are not delivered to clients through this path.
    async fn apply_membership(&self, envelope: &EventEnvelope) {
        let (Some(user), Some(channel)) =
            (envelope.author.as_deref(), envelope.channel_id.as_deref())
        else {
            return;
        };
        self.cache.invalidate(user, channel).await;
        match envelope.kind {
            EventKind::MemberJoin => self.table.add_membership(user, channel),
            EventKind::MemberLeave => self.table.remove_membership(user, channel),
            _ => {}
        }
    }

    /// Route ephemeral typing events: channel instances minus origin.
    async fn typing_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut sub = match self.bus.subscribe(subject::TYPING_WILDCARD).await {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "typing subscription failed");
                return;
            }
        };
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = sub.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            let envelope: EventEnvelope = match serde_json::from_slice(&msg.payload) {
                Ok(e) => e,
                Err(e) => {
                    debug!("invalid typing envelope: {e}");
                    continue;
                }
            };
            if let Ok(Routed::Deliver(targets)) = self.channel_targets(&envelope).await {
                self.publish_ephemeral(&envelope, &targets).await;
            }
        }
    }

    /// Route user-sync events. Single-tasked, so events for one user
    /// keep their order.
    async fn user_sync_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut sub = match self.bus.subscribe(subject::USER_SYNC_WILDCARD).await {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "user-sync subscription failed");
                return;
            }
        };
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = sub.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            let envelope: EventEnvelope = match serde_json::from_slice(&msg.payload) {
                Ok(e) => e,
                Err(e) => {
                    debug!("invalid sync envelope: {e}");
                    continue;
                }
            };
            let Some(user) = envelope.target_user() else {
                continue;
            };
            let targets = self.table.user_instances(user);
            if !targets.is_empty() {
                self.publish_ephemeral(&envelope, &targets).await;
            }
        }
    }

    async fn publish_ephemeral(&self, envelope: &EventEnvelope, targets: &[String]) {
        let batch = EnvelopeBatch::single(envelope.clone());
        let Ok(payload) = serde_json::to_vec(&batch) else {
            return;
        };
        for instance in targets {
            if let Err(e) = self
                .bus
                .publish(&subject::instance_events(instance), payload.clone().into())
                .await
            {
                debug!(instance = %instance, "ephemeral publish failed: {e}");
            } else {
                metrics::counter!("pulse_fanout_publishes_total").increment(1);
            }
        }
    }
}

/// Shard assignment: channel id for channel events, user id for
/// user-scoped ones, so both kinds keep per-key order.
fn shard_for(envelope: &EventEnvelope, shards: usize) -> usize {
    let key = envelope
        .channel_id
        .as_deref()
        .or(envelope.author.as_deref())
        .unwrap_or(envelope.event_id.as_str());
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize % shards
}

/// Exponential backoff for NAK redelivery, capped at ~16 s.
fn backoff(deliveries: u64) -> Duration {
    let exp = deliveries.min(6);
    Duration::from_millis(250) * 2u32.saturating_pow(exp as u32)
}

#[cfg(test)]
#[path = "fanout_tests.rs"]
mod tests;
