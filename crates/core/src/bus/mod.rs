// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event-bus capability surface.
//!
//! The core consumes three bus primitives: ephemeral pub/sub with subject
//! wildcards, a durable log with pull consumers and explicit ack/NAK, and
//! bounded replay from a log sequence. [`mem`] provides the in-memory
//! implementation every test runs against; [`nats`] is the production
//! driver (core NATS + JetStream).

pub mod mem;
pub mod nats;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::envelope::EventEnvelope;

/// A message received from an ephemeral subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Acknowledgement handle for one pulled log event.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> anyhow::Result<()>;
    /// Negative-ack: request redelivery, optionally after a delay.
    async fn nak(self: Box<Self>, delay: Option<Duration>) -> anyhow::Result<()>;
}

/// An event pulled from the durable log, pending acknowledgement.
pub struct PulledEvent {
    pub envelope: EventEnvelope,
    /// How many times this event has been delivered (1 on first pull);
    /// drives redelivery backoff.
    pub deliveries: u64,
    acker: Box<dyn Acker>,
}

impl PulledEvent {
    pub fn new(envelope: EventEnvelope, deliveries: u64, acker: Box<dyn Acker>) -> Self {
        Self { envelope, deliveries, acker }
    }

    pub async fn ack(self) -> anyhow::Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(self, delay: Option<Duration>) -> anyhow::Result<()> {
        self.acker.nak(delay).await
    }
}

impl std::fmt::Debug for PulledEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulledEvent").field("envelope", &self.envelope).finish()
    }
}

/// Durable pull consumer over the events log.
#[async_trait]
pub trait LogConsumer: Send {
    /// Fetch up to `max` events. Returns an empty batch when nothing is
    /// available within the driver's poll window.
    async fn fetch(&mut self, max: usize) -> anyhow::Result<Vec<PulledEvent>>;
}

/// The bus driver consumed by both services.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Ephemeral publish; fire-and-forget delivery to current subscribers.
    async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Ephemeral subscription; `subject` may use `*`/`>` wildcards.
    async fn subscribe(&self, subject: &str) -> anyhow::Result<mpsc::Receiver<BusMessage>>;

    /// Durable pull consumer named `name` over the events log, filtered
    /// to `filters`. One consumer per fan-out worker group.
    async fn log_consumer(
        &self,
        name: &str,
        filters: &[String],
    ) -> anyhow::Result<Box<dyn LogConsumer>>;

    /// Append an envelope to the durable log under `subject`. Returns
    /// the assigned stream sequence.
    async fn log_publish(&self, subject: &str, envelope: &EventEnvelope)
        -> anyhow::Result<u64>;

    /// Bounded ephemeral replay of log envelopes with `seq > after_seq`,
    /// in sequence order. Used by T1 catchup.
    async fn log_replay(&self, after_seq: u64, max: usize)
        -> anyhow::Result<Vec<EventEnvelope>>;

    /// Highest sequence currently in the log.
    async fn log_head(&self) -> anyhow::Result<u64>;
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::subject_matches;
    use yare::parameterized;

    #[parameterized(
        exact = { "typing.ch_x", "typing.ch_x", true },
        star = { "instance.events.*", "instance.events.n1", true },
        star_two_tokens = { "instance.events.*", "instance.events.n1.x", false },
        tail = { "user.sync.>", "user.sync.alice", true },
        tail_multi = { "messages.>", "messages.send.ch_x", true },
        tail_empty = { "messages.>", "messages", false },
        mismatch = { "typing.ch_x", "typing.ch_y", false },
        longer_subject = { "typing.ch_x", "typing.ch_x.extra", false },
    )]
    fn matching(pattern: &str, subject: &str, expected: bool) {
        assert_eq!(subject_matches(pattern, subject), expected);
    }
}
