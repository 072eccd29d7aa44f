// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for notifier tests: a full `Store` over the
//! in-memory bus/KV/store fakes, and an in-process HTTP server for
//! WebSocket tests.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use pulse_core::bus::mem::MemBus;
use pulse_core::bus::Bus;
use pulse_core::keys;
use pulse_core::kv::{Kv, KvSet};
use pulse_core::store::{MemDirectory, MemMessageStore, MembershipSource, MessageStore};

use crate::config::Config;
use crate::session::Session;
use crate::state::{NotifierDeps, Store};

pub struct TestHarness {
    pub store: Arc<Store>,
    pub bus: MemBus,
    pub kv: KvSet,
    pub dir: Arc<MemDirectory>,
    pub messages: Arc<MemMessageStore>,
    pub shutdown: CancellationToken,
}

/// Build a notifier `Store` on in-memory fakes with default config.
pub fn harness(instance: &str) -> TestHarness {
    harness_with(instance, |_| {})
}

/// Same, with a config hook for tests that need smaller knobs.
pub fn harness_with(instance: &str, tweak: impl FnOnce(&mut Config)) -> TestHarness {
    let mut config = Config::parse_from(["pulse-notifier"]);
    tweak(&mut config);

    let bus = MemBus::new();
    let kv = KvSet::in_memory();
    let dir = Arc::new(MemDirectory::new());
    let messages = Arc::new(MemMessageStore::new());
    let shutdown = CancellationToken::new();

    let deps = NotifierDeps {
        bus: Arc::new(bus.clone()) as Arc<dyn Bus>,
        kv: kv.clone(),
        membership: Arc::clone(&dir) as Arc<dyn MembershipSource>,
        messages: Arc::clone(&messages) as Arc<dyn MessageStore>,
    };
    let store = Arc::new(Store::new(config, instance.to_owned(), deps, shutdown.clone()));
    TestHarness { store, bus, kv, dir, messages, shutdown }
}

impl TestHarness {
    /// Register a connected session, indexing the user's channels from
    /// the directory and publishing presence.
    pub async fn connect(&self, user: &str, device: &str) -> anyhow::Result<Arc<Session>> {
        let channels = self.dir.channels_for_user(user).await?;
        let session = Arc::new(Session::new(
            user,
            device,
            self.store.config.session_outbound_queue_size,
        ));
        self.store.registry.register(Arc::clone(&session), channels).await;
        self.store.presence.update(&self.store.registry, user).await?;
        Ok(session)
    }

    /// Store a one-time handshake token the way the auth side would.
    pub async fn issue_token(&self, token: &str, user: &str, device: &str) -> anyhow::Result<()> {
        let claims = serde_json::json!({ "user": user, "device": device });
        self.kv
            .tokens
            .put(&keys::ws_token(token), serde_json::to_vec(&claims)?.into())
            .await
    }
}

/// Serve the notifier router on an ephemeral port.
pub async fn spawn_server(
    store: Arc<Store>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let shutdown = store.shutdown.clone();
    let router = crate::ws::app_router(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
    });
    Ok((addr, handle))
}
