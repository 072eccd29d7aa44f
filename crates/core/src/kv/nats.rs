// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JetStream KV driver.
//!
//! One `NatsKv` wraps one bucket; TTL is the bucket's `max_age`,
//! refreshed by writes. Logical keys use `:` separators
//! (`presence:user:alice`) which JetStream KV does not allow, so keys
//! are transposed to `.` on the wire and back on the way out — ids must
//! therefore not contain `:` or `.`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::kv::{Kv, KvEntry};

const WATCH_DEPTH: usize = 256;

/// JetStream-KV-backed [`Kv`] implementation over a single bucket.
pub struct NatsKv {
    store: async_nats::jetstream::kv::Store,
}

impl NatsKv {
    /// Bind the bucket, creating it with `max_age` if absent
    /// (`None` = no expiry).
    pub async fn open(
        js: &async_nats::jetstream::Context,
        bucket: &str,
        max_age: Option<Duration>,
    ) -> anyhow::Result<Self> {
        if let Ok(store) = js.get_key_value(bucket).await {
            return Ok(Self { store });
        }
        let store = js
            .create_key_value(async_nats::jetstream::kv::Config {
                bucket: bucket.to_owned(),
                max_age: max_age.unwrap_or_default(),
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("kv bucket {bucket}: {e}"))?;
        Ok(Self { store })
    }
}

fn encode_key(key: &str) -> String {
    key.replace(':', ".")
}

fn decode_key(key: &str) -> String {
    key.replace('.', ":")
}

#[async_trait]
impl Kv for NatsKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        self.store
            .get(encode_key(key))
            .await
            .map_err(|e| anyhow::anyhow!("kv get {key}: {e}"))
    }

    async fn put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        self.store
            .put(encode_key(key), value)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("kv put {key}: {e}"))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.store
            .purge(encode_key(key))
            .await
            .map_err(|e| anyhow::anyhow!("kv delete {key}: {e}"))
    }

    async fn take(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let encoded = encode_key(key);
        let entry = self
            .store
            .entry(encoded.clone())
            .await
            .map_err(|e| anyhow::anyhow!("kv entry {key}: {e}"))?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        if matches!(
            entry.operation,
            async_nats::jetstream::kv::Operation::Delete
                | async_nats::jetstream::kv::Operation::Purge
        ) {
            return Ok(None);
        }
        // Revision-guarded purge: a concurrent take wins the race and we
        // report a miss instead of double-spending the entry.
        match self.store.purge_expect_revision(encoded, Some(entry.revision)).await {
            Ok(()) => Ok(Some(entry.value)),
            Err(_) => Ok(None),
        }
    }

    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let encoded_prefix = encode_key(prefix);
        let mut stream = self
            .store
            .keys()
            .await
            .map_err(|e| anyhow::anyhow!("kv keys: {e}"))?;
        let mut out = Vec::new();
        while let Some(key) = stream.next().await {
            let key = key.map_err(|e| anyhow::anyhow!("kv key read: {e}"))?;
            if key.starts_with(&encoded_prefix) {
                out.push(decode_key(&key));
            }
        }
        Ok(out)
    }

    async fn watch(&self, prefix: &str) -> anyhow::Result<mpsc::Receiver<KvEntry>> {
        let pattern = format!("{}>", encode_key(prefix));
        let mut watch = self
            .store
            .watch(pattern)
            .await
            .map_err(|e| anyhow::anyhow!("kv watch {prefix}: {e}"))?;

        let (tx, rx) = mpsc::channel(WATCH_DEPTH);
        tokio::spawn(async move {
            while let Some(entry) = watch.next().await {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(err = %e, "kv watch error");
                        continue;
                    }
                };
                let value = match entry.operation {
                    async_nats::jetstream::kv::Operation::Put => Some(entry.value),
                    async_nats::jetstream::kv::Operation::Delete
                    | async_nats::jetstream::kv::Operation::Purge => None,
                };
                let out = KvEntry { key: decode_key(&entry.key), value };
                if tx.send(out).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_key, encode_key};

    #[test]
    fn key_transposition_round_trips() {
        let key = "presence:user:alice";
        assert_eq!(encode_key(key), "presence.user.alice");
        assert_eq!(decode_key(&encode_key(key)), key);
    }
}
