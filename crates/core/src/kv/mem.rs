// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory KV store with store-level TTL and prefix watches.
//!
//! Expired entries are purged on access; [`MemKv::sweep`] purges the
//! whole store and emits expiry notifications to watchers, standing in
//! for the server-side ager. Tests call it directly for determinism;
//! long-running local setups spawn it on an interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::kv::{Kv, KvEntry};

const WATCH_DEPTH: usize = 256;

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<KvEntry>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    watchers: Vec<Watcher>,
}

/// In-memory [`Kv`] implementation.
#[derive(Clone)]
pub struct MemKv {
    inner: Arc<Mutex<Inner>>,
    ttl: Option<Duration>,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    /// Store without expiry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { entries: HashMap::new(), watchers: Vec::new() })),
            ttl: None,
        }
    }

    /// Store whose entries expire `ttl` after their last write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl), ..Self::new() }
    }

    /// Purge expired entries, notifying watchers of each expiry.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
            notify(&mut inner.watchers, &key, None);
        }
    }

    /// Expire one entry immediately (test hook for TTL-driven paths).
    pub async fn expire_now(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(key).is_some() {
            notify(&mut inner.watchers, key, None);
        }
    }
}

fn notify(watchers: &mut Vec<Watcher>, key: &str, value: Option<Bytes>) {
    watchers.retain(|w| !w.tx.is_closed());
    for watcher in watchers.iter() {
        if key.starts_with(&watcher.prefix) {
            let _ = watcher.tx.try_send(KvEntry { key: key.to_owned(), value: value.clone() });
        }
    }
}

#[async_trait]
impl Kv for MemKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.entries.get(key).is_some_and(|e| e.expired(now)) {
            inner.entries.remove(key);
            return Ok(None);
        }
        Ok(inner.entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        let mut inner = self.inner.lock().await;
        inner.entries.insert(key.to_owned(), Entry { value: value.clone(), expires_at });
        notify(&mut inner.watchers, key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(key).is_some() {
            notify(&mut inner.watchers, key, None);
        }
        Ok(())
    }

    async fn take(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.entries.remove(key) {
            Some(entry) if !entry.expired(now) => {
                notify(&mut inner.watchers, key, None);
                Ok(Some(entry.value))
            }
            _ => Ok(None),
        }
    }

    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn watch(&self, prefix: &str) -> anyhow::Result<mpsc::Receiver<KvEntry>> {
        let (tx, rx) = mpsc::channel(WATCH_DEPTH);
        self.inner.lock().await.watchers.push(Watcher { prefix: prefix.to_owned(), tx });
        Ok(rx)
    }
}

#[cfg(test)]
#[path = "mem_tests.rs"]
mod tests;
