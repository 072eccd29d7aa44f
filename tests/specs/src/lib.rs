// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end delivery scenarios.
//!
//! Stands up a full fan-out cluster over the in-memory bus and KV
//! fakes: one running router (routing table, presence tracker, fan-out
//! workers) plus any number of notification-server instances with live
//! inbox subscriptions. Scenario tests drive it through the same bus
//! subjects production uses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use pulse_core::bus::mem::MemBus;
use pulse_core::bus::Bus;
use pulse_core::envelope::{EventEnvelope, EventKind};
use pulse_core::kv::KvSet;
use pulse_core::store::{MemDirectory, MemMessageStore, MembershipSource, MessageStore};
use pulse_core::subject;

use pulse_notifier::session::Session;
use pulse_notifier::state::{NotifierDeps, Store};

use pulse_router::fanout::{FanOut, FanOutConfig};
use pulse_router::followers::FollowerCache;
use pulse_router::membership::MembershipCache;
use pulse_router::presence::PresenceTracker;
use pulse_router::routing::RoutingTable;

pub struct Cluster {
    pub bus: MemBus,
    pub kv: KvSet,
    pub dir: Arc<MemDirectory>,
    pub messages: Arc<MemMessageStore>,
    pub table: Arc<RoutingTable>,
    pub shutdown: CancellationToken,
    instances: HashMap<String, Arc<Store>>,
}

impl Cluster {
    /// Start a cluster with a running router and no instances yet.
    pub async fn start() -> anyhow::Result<Self> {
        let bus = MemBus::new();
        let kv = KvSet::in_memory();
        let dir = Arc::new(MemDirectory::new());
        let messages = Arc::new(MemMessageStore::new());
        let shutdown = CancellationToken::new();

        let table = Arc::new(RoutingTable::new());
        let source = Arc::clone(&dir) as Arc<dyn MembershipSource>;
        let cache = Arc::new(MembershipCache::new(Arc::clone(&source), 4096));
        let followers = Arc::new(FollowerCache::new(source, Duration::from_secs(1800)));

        let tracker = Arc::new(PresenceTracker::new(
            Arc::clone(&table),
            Arc::clone(&cache),
            Arc::new(bus.clone()) as Arc<dyn Bus>,
        ));
        Arc::clone(&tracker).spawn(Arc::clone(&kv.presence), shutdown.clone());

        let fanout = Arc::new(FanOut::new(
            Arc::clone(&table),
            cache,
            followers,
            Arc::new(bus.clone()) as Arc<dyn Bus>,
            Arc::clone(&kv.durable),
            FanOutConfig { batch_window: Duration::from_millis(1), ..FanOutConfig::default() },
        ));
        {
            let sd = shutdown.clone();
            tokio::spawn(async move {
                let _ = fanout.run(sd).await;
            });
        }
        // Let the router's subscriptions come up.
        tokio::time::sleep(Duration::from_millis(20)).await;

        Ok(Self { bus, kv, dir, messages, table, shutdown, instances: HashMap::new() })
    }

    /// Add a notification-server instance with a live inbox.
    pub async fn add_instance(&mut self, id: &str) -> Arc<Store> {
        let config = pulse_notifier::config::Config::parse_from(["pulse-notifier"]);
        let deps = NotifierDeps {
            bus: Arc::new(self.bus.clone()) as Arc<dyn Bus>,
            kv: self.kv.clone(),
            membership: Arc::clone(&self.dir) as Arc<dyn MembershipSource>,
            messages: Arc::clone(&self.messages) as Arc<dyn MessageStore>,
        };
        let store =
            Arc::new(Store::new(config, id.to_owned(), deps, self.shutdown.clone()));
        {
            let store = Arc::clone(&store);
            let sd = self.shutdown.clone();
            tokio::spawn(async move {
                let _ = pulse_notifier::inbox::run(store, sd).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.instances.insert(id.to_owned(), Arc::clone(&store));
        store
    }

    pub fn instance(&self, id: &str) -> Option<Arc<Store>> {
        self.instances.get(id).cloned()
    }

    /// Open a session on an instance: register, publish presence, and
    /// wait for the router to route the user's channels there.
    pub async fn connect(
        &self,
        instance: &str,
        user: &str,
        device: &str,
    ) -> anyhow::Result<Arc<Session>> {
        let store = self
            .instances
            .get(instance)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown instance {instance}"))?;
        let channels = self.dir.channels_for_user(user).await?;
        let session = Arc::new(Session::new(
            user,
            device,
            store.config.session_outbound_queue_size,
        ));
        store.registry.register(Arc::clone(&session), channels).await;
        store.presence.update(&store.registry, user).await?;

        // Routing convergence: presence flows through the bus to the
        // tracker before events can target this instance.
        let table = Arc::clone(&self.table);
        let expect_instance = instance.to_owned();
        let expect_user = user.to_owned();
        wait_for("presence routed", move || {
            let table = Arc::clone(&table);
            let instance = expect_instance.clone();
            let user = expect_user.clone();
            async move { table.user_instances(&user).contains(&instance) }
        })
        .await?;
        Ok(session)
    }

    /// Close a session and publish the presence downgrade.
    pub async fn disconnect(&self, instance: &str, session: &Arc<Session>) -> anyhow::Result<()> {
        let store = self
            .instances
            .get(instance)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown instance {instance}"))?;
        store.registry.deregister(&session.id).await;
        store.presence.update(&store.registry, &session.user).await?;
        Ok(())
    }

    /// Append a channel message to the durable log, as the write side
    /// would, and mirror it into the message store the way the
    /// persistence worker does. Returns the assigned sequence.
    pub async fn send_message(&self, envelope: &EventEnvelope) -> anyhow::Result<u64> {
        let channel = envelope.channel_id.clone().unwrap_or_default();
        let op = match envelope.kind {
            EventKind::MessageEdited => "edit",
            EventKind::MessageDeleted => "delete",
            EventKind::MessageReaction => "react",
            EventKind::ThreadReply => "thread_reply",
            _ => "send",
        };
        let seq = self.bus.log_publish(&subject::message(op, &channel), envelope).await?;
        let mut stored = envelope.clone();
        stored.seq = seq;
        self.messages.push(stored).await;
        Ok(seq)
    }
}

/// Poll until `predicate` holds, failing after a generous deadline.
pub async fn wait_for<F, Fut>(what: &str, mut predicate: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pop the next frame from a session's queue, waiting briefly.
pub async fn next_frame(
    session: &Arc<Session>,
) -> anyhow::Result<pulse_core::frame::ServerFrame> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(frame) = session.outbound.pop() {
            return Ok(frame);
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for a frame");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pop frames until one matches, discarding the rest (presence noise
/// from connect churn is expected).
pub async fn next_frame_where(
    session: &Arc<Session>,
    mut predicate: impl FnMut(&pulse_core::frame::ServerFrame) -> bool,
) -> anyhow::Result<pulse_core::frame::ServerFrame> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        while let Some(frame) = session.outbound.pop() {
            if predicate(&frame) {
                return Ok(frame);
            }
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for a matching frame");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Build a message envelope the way the write side does (sequence is
/// assigned by the log).
pub fn message(id: &str, channel: &str, author: &str) -> EventEnvelope {
    EventEnvelope {
        event_id: id.to_owned(),
        seq: 0,
        kind: EventKind::MessageNew,
        channel_id: Some(channel.to_owned()),
        thread_id: None,
        origin_instance: None,
        origin_session: None,
        author: Some(author.to_owned()),
        also_send_to_channel: None,
        ts_ms: pulse_core::now_ms(),
        payload: serde_json::json!({ "text": "hi" }),
    }
}
