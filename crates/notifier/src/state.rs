// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-instance singleton state shared by every task on a notification
//! server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use pulse_core::bus::Bus;
use pulse_core::dedup::DedupRing;
use pulse_core::frame::ServerFrame;
use pulse_core::kv::KvSet;
use pulse_core::store::{MembershipSource, MessageStore};

use crate::catchup::{CatchupConfig, CatchupEngine};
use crate::config::Config;
use crate::error::CloseReason;
use crate::presence::PresencePublisher;
use crate::readstate::ReadState;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Inbox-level dedup window; covers NAK redelivery overlap.
const INBOX_DEDUP_WINDOW: usize = 4096;

/// How long a cached thread-follower set is trusted.
const THREAD_FOLLOWER_STALENESS: Duration = Duration::from_secs(1800);

/// External collaborators the notifier consumes, injected by the caller.
pub struct NotifierDeps {
    pub bus: Arc<dyn Bus>,
    pub kv: KvSet,
    pub membership: Arc<dyn MembershipSource>,
    pub messages: Arc<dyn MessageStore>,
}

pub struct Store {
    pub config: Config,
    pub instance: String,
    pub registry: SessionRegistry,
    pub bus: Arc<dyn Bus>,
    pub kv: KvSet,
    pub membership: Arc<dyn MembershipSource>,
    pub presence: PresencePublisher,
    pub readstate: ReadState,
    pub catchup: CatchupEngine,
    pub shutdown: CancellationToken,
    /// Cleared under inbox lag or at session capacity; gates upgrades.
    pub accepting: AtomicBool,
    /// Live fan-in dedup: bus redelivery must not reach sessions twice.
    pub dedup: Mutex<DedupRing>,
    /// Local thread-follower view, fetched lazily from the membership
    /// source and trusted for a bounded staleness window.
    pub threads: Mutex<std::collections::HashMap<String, FollowerEntry>>,
}

pub struct FollowerEntry {
    pub followers: std::collections::HashSet<String>,
    pub fetched_at: Instant,
}

impl FollowerEntry {
    pub fn stale(&self) -> bool {
        self.fetched_at.elapsed() > THREAD_FOLLOWER_STALENESS
    }
}

impl Store {
    pub fn new(
        config: Config,
        instance: String,
        deps: NotifierDeps,
        shutdown: CancellationToken,
    ) -> Self {
        let catchup_config = CatchupConfig {
            t1_max_gap: Duration::from_secs(config.t1_max_gap_seconds),
            t2_max_gap: Duration::from_secs(config.t2_max_gap_seconds),
            t3_max_gap: Duration::from_secs(config.t3_max_gap_seconds),
            active_channel_cap: config.active_channels_per_user_cap,
            scan_concurrency: config.t2_scan_concurrency,
            batch_limit: 500,
        };
        Self {
            presence: PresencePublisher::new(
                instance.clone(),
                Arc::clone(&deps.kv.presence),
                Arc::clone(&deps.bus),
            ),
            readstate: ReadState::new(
                deps.kv.clone(),
                Arc::clone(&deps.bus),
                Arc::clone(&deps.messages),
            ),
            catchup: CatchupEngine::new(
                Arc::clone(&deps.bus),
                deps.kv.clone(),
                Arc::clone(&deps.messages),
                Arc::clone(&deps.membership),
                catchup_config,
            ),
            registry: SessionRegistry::new(),
            bus: deps.bus,
            kv: deps.kv,
            membership: deps.membership,
            instance,
            config,
            shutdown,
            accepting: AtomicBool::new(true),
            dedup: Mutex::new(DedupRing::new(INBOX_DEDUP_WINDOW)),
            threads: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Whether a new session may be accepted right now.
    pub async fn can_accept(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
            && self.registry.len().await < self.config.max_sessions_per_instance
    }

    /// Ask a session to close: the terminated frame goes out first, then
    /// the connection tasks unwind through the cancel token.
    pub fn request_close(&self, session: &Session, reason: CloseReason) {
        let _ = session
            .outbound
            .push(ServerFrame::SessionTerminated { reason: reason.as_str().to_owned() });
        session.cancel.cancel();
    }

    /// Local follower view for a thread, fetched on miss or staleness.
    pub async fn thread_followers(
        &self,
        thread: &str,
    ) -> anyhow::Result<std::collections::HashSet<String>> {
        {
            let threads = self.threads.lock().await;
            if let Some(entry) = threads.get(thread) {
                if !entry.stale() {
                    return Ok(entry.followers.clone());
                }
            }
        }
        let followers: std::collections::HashSet<String> =
            self.membership.thread_followers(thread).await?.into_iter().collect();
        self.threads.lock().await.insert(
            thread.to_owned(),
            FollowerEntry { followers: followers.clone(), fetched_at: Instant::now() },
        );
        Ok(followers)
    }
}
