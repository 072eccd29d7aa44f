// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory bus used by every test and by local development.
//!
//! Semantics mirror the NATS driver: ephemeral publishes reach only the
//! subscribers alive at publish time (a lagging subscriber loses
//! messages), the log assigns monotonic sequences, and each pull
//! consumer tracks its own cursor with NAK redelivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::bus::{subject_matches, Acker, Bus, BusMessage, LogConsumer, PulledEvent};
use crate::envelope::EventEnvelope;

const SUBSCRIPTION_DEPTH: usize = 1024;

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

struct LogState {
    /// (subject, envelope) per sequence; seq = index + 1.
    entries: Vec<(String, EventEnvelope)>,
}

struct Inner {
    subs: Mutex<Vec<Subscription>>,
    log: Mutex<LogState>,
}

/// In-memory [`Bus`] implementation.
#[derive(Clone)]
pub struct MemBus {
    inner: Arc<Inner>,
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: Mutex::new(Vec::new()),
                log: Mutex::new(LogState { entries: Vec::new() }),
            }),
        }
    }

    /// Current log length (highest assigned sequence).
    pub async fn log_len(&self) -> u64 {
        self.inner.log.lock().await.entries.len() as u64
    }

    /// Live ephemeral subscription count, for tests.
    pub async fn subscription_count(&self) -> usize {
        let mut subs = self.inner.subs.lock().await;
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }
}

#[async_trait]
impl Bus for MemBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
        let mut subs = self.inner.subs.lock().await;
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            if subject_matches(&sub.pattern, subject) {
                // Full subscriber queues drop, as a slow NATS consumer would.
                let _ = sub.tx.try_send(BusMessage {
                    subject: subject.to_owned(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> anyhow::Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        self.inner.subs.lock().await.push(Subscription { pattern: subject.to_owned(), tx });
        Ok(rx)
    }

    async fn log_consumer(
        &self,
        _name: &str,
        filters: &[String],
    ) -> anyhow::Result<Box<dyn LogConsumer>> {
        Ok(Box::new(MemLogConsumer {
            inner: Arc::clone(&self.inner),
            filters: filters.to_vec(),
            cursor: 0,
            redeliver: Arc::new(Mutex::new(VecDeque::new())),
            attempts: std::collections::HashMap::new(),
        }))
    }

    async fn log_publish(
        &self,
        subject: &str,
        envelope: &EventEnvelope,
    ) -> anyhow::Result<u64> {
        let mut log = self.inner.log.lock().await;
        let seq = log.entries.len() as u64 + 1;
        let mut envelope = envelope.clone();
        envelope.seq = seq;
        log.entries.push((subject.to_owned(), envelope));
        Ok(seq)
    }

    async fn log_replay(
        &self,
        after_seq: u64,
        max: usize,
    ) -> anyhow::Result<Vec<EventEnvelope>> {
        let log = self.inner.log.lock().await;
        let start = (after_seq as usize).min(log.entries.len());
        Ok(log.entries[start..].iter().take(max).map(|(_, e)| e.clone()).collect())
    }

    async fn log_head(&self) -> anyhow::Result<u64> {
        Ok(self.inner.log.lock().await.entries.len() as u64)
    }
}

struct MemLogConsumer {
    inner: Arc<Inner>,
    filters: Vec<String>,
    /// Highest sequence handed out so far.
    cursor: u64,
    /// Sequences NAKed for redelivery.
    redeliver: Arc<Mutex<VecDeque<u64>>>,
    /// Delivery counts per sequence.
    attempts: std::collections::HashMap<u64, u64>,
}

#[async_trait]
impl LogConsumer for MemLogConsumer {
    async fn fetch(&mut self, max: usize) -> anyhow::Result<Vec<PulledEvent>> {
        let mut out = Vec::new();

        let redelivery: Vec<u64> = {
            let mut queue = self.redeliver.lock().await;
            queue.drain(..).collect()
        };
        let inner = Arc::clone(&self.inner);
        let log = inner.log.lock().await;
        for seq in redelivery {
            if out.len() >= max {
                // Put the rest back for the next fetch.
                self.redeliver.lock().await.push_back(seq);
                continue;
            }
            if let Some((_, envelope)) = log.entries.get(seq as usize - 1) {
                let envelope = envelope.clone();
                out.push(self.pulled(envelope));
            }
        }

        while out.len() < max && (self.cursor as usize) < log.entries.len() {
            let (subject, envelope) = &log.entries[self.cursor as usize];
            let envelope =
                self.filters.iter().any(|f| subject_matches(f, subject)).then(|| envelope.clone());
            self.cursor += 1;
            if let Some(envelope) = envelope {
                out.push(self.pulled(envelope));
            }
        }
        Ok(out)
    }
}

impl MemLogConsumer {
    fn pulled(&mut self, envelope: EventEnvelope) -> PulledEvent {
        let seq = envelope.seq;
        let deliveries = self.attempts.entry(seq).or_insert(0);
        *deliveries += 1;
        PulledEvent::new(
            envelope,
            *deliveries,
            Box::new(MemAcker { seq, redeliver: Arc::clone(&self.redeliver) }),
        )
    }
}

struct MemAcker {
    seq: u64,
    redeliver: Arc<Mutex<VecDeque<u64>>>,
}

#[async_trait]
impl Acker for MemAcker {
    async fn ack(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn nak(self: Box<Self>, _delay: Option<Duration>) -> anyhow::Result<()> {
        self.redeliver.lock().await.push_back(self.seq);
        Ok(())
    }
}

#[cfg(test)]
#[path = "mem_tests.rs"]
mod tests;
