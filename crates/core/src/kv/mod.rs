// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! KV capability surface.
//!
//! Entries live in one of four stores with distinct TTL policies (see
//! [`KvSet`]). TTL is a property of the store, refreshed by writes, so
//! a heartbeat put keeps a presence record alive and a crashed instance
//! ages out on its own.

pub mod mem;
pub mod nats;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

/// A change notification from [`Kv::watch`]. `value == None` signals a
/// delete or TTL expiry.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: Option<Bytes>,
}

#[async_trait]
pub trait Kv: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;
    async fn put(&self, key: &str, value: Bytes) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Atomic get-and-delete; a second concurrent take loses and gets
    /// `None`. Single-use handshake tokens depend on this.
    async fn take(&self, key: &str) -> anyhow::Result<Option<Bytes>>;
    /// All keys under `prefix`.
    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    /// Change notifications for keys under `prefix`.
    async fn watch(&self, prefix: &str) -> anyhow::Result<mpsc::Receiver<KvEntry>>;
}

/// Fetch and decode a JSON record.
pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn Kv,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match kv.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and store a JSON record.
pub async fn put_json<T: Serialize>(kv: &dyn Kv, key: &str, value: &T) -> anyhow::Result<()> {
    kv.put(key, serde_json::to_vec(value)?.into()).await
}

/// The four stores the core uses, grouped for injection.
///
/// | Store | Contents | TTL |
/// |---|---|---|
/// | `presence` | presence records, instance registrations | ~120 s, heartbeat-refreshed |
/// | `sessions` | reconnect checkpoints | 24 h |
/// | `tokens` | one-time handshake tokens | ~30 s |
/// | `durable` | read pointers, channel-latest, unread counters | none |
#[derive(Clone)]
pub struct KvSet {
    pub presence: Arc<dyn Kv>,
    pub sessions: Arc<dyn Kv>,
    pub tokens: Arc<dyn Kv>,
    pub durable: Arc<dyn Kv>,
}

impl KvSet {
    /// In-memory set with the production TTL shape, for tests and local
    /// development.
    pub fn in_memory() -> Self {
        Self {
            presence: Arc::new(mem::MemKv::with_ttl(Duration::from_secs(120))),
            sessions: Arc::new(mem::MemKv::with_ttl(Duration::from_secs(24 * 3600))),
            tokens: Arc::new(mem::MemKv::with_ttl(Duration::from_secs(30))),
            durable: Arc::new(mem::MemKv::new()),
        }
    }
}
