// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS bus driver: core NATS for ephemeral pub/sub, JetStream for the
//! durable events log.
//!
//! The events stream is created on first use if absent; production
//! deployments normally pre-provision it with their own retention. Log
//! retention bounds how far back T1 replay can reach.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::bus::{Acker, Bus, BusMessage, LogConsumer, PulledEvent};
use crate::envelope::EventEnvelope;
use crate::subject;

const SUBSCRIPTION_DEPTH: usize = 1024;
const ACK_WAIT: Duration = Duration::from_secs(30);
const REPLAY_EXPIRES: Duration = Duration::from_secs(5);

/// NATS-backed [`Bus`] implementation.
pub struct NatsBus {
    client: async_nats::Client,
    stream: async_nats::jetstream::stream::Stream,
    js: async_nats::jetstream::Context,
}

impl NatsBus {
    /// Connect to the NATS server and bind (or create) the events stream.
    pub async fn connect(url: &str, token: Option<&str>) -> anyhow::Result<Self> {
        let mut opts = async_nats::ConnectOptions::new();
        if let Some(token) = token {
            opts = opts.token(token.to_owned());
        }
        opts = opts.retry_on_initial_connect();

        tracing::info!(url = %url, "connecting to NATS");
        let client = opts.connect(url).await?;

        let js = async_nats::jetstream::new(client.clone());
        let stream = js
            .get_or_create_stream(async_nats::jetstream::stream::Config {
                name: subject::EVENTS_STREAM.to_owned(),
                subjects: subject::LOG_FILTER_SUBJECTS.iter().map(|s| (*s).to_owned()).collect(),
                max_age: Duration::from_secs(15 * 60),
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("events stream: {e}"))?;

        tracing::info!(stream = subject::EVENTS_STREAM, "NATS connected");
        Ok(Self { client, stream, js })
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
        self.client
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|e| anyhow::anyhow!("publish {subject}: {e}"))
    }

    async fn subscribe(&self, subject: &str) -> anyhow::Result<mpsc::Receiver<BusMessage>> {
        let mut sub = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|e| anyhow::anyhow!("subscribe {subject}: {e}"))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let out = BusMessage { subject: msg.subject.to_string(), payload: msg.payload };
                if tx.send(out).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn log_consumer(
        &self,
        name: &str,
        filters: &[String],
    ) -> anyhow::Result<Box<dyn LogConsumer>> {
        use async_nats::jetstream::consumer::pull::Config as PullConfig;
        use async_nats::jetstream::consumer::AckPolicy;

        let config = PullConfig {
            durable_name: Some(name.to_owned()),
            filter_subjects: filters.to_vec(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: ACK_WAIT,
            ..Default::default()
        };
        let consumer = self
            .stream
            .get_or_create_consumer(name, config)
            .await
            .map_err(|e| anyhow::anyhow!("consumer {name}: {e}"))?;

        Ok(Box::new(NatsLogConsumer { consumer }))
    }

    async fn log_publish(
        &self,
        subject: &str,
        envelope: &EventEnvelope,
    ) -> anyhow::Result<u64> {
        let payload = serde_json::to_vec(envelope)?;
        let ack = self
            .js
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|e| anyhow::anyhow!("log publish {subject}: {e}"))?
            .await
            .map_err(|e| anyhow::anyhow!("log publish ack {subject}: {e}"))?;
        Ok(ack.sequence)
    }

    async fn log_replay(
        &self,
        after_seq: u64,
        max: usize,
    ) -> anyhow::Result<Vec<EventEnvelope>> {
        use async_nats::jetstream::consumer::pull::Config as PullConfig;
        use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};

        // Ephemeral consumer, cleaned up by the server after inactivity.
        let config = PullConfig {
            deliver_policy: DeliverPolicy::ByStartSequence { start_sequence: after_seq + 1 },
            ack_policy: AckPolicy::None,
            inactive_threshold: Duration::from_secs(60),
            ..Default::default()
        };
        let consumer = self
            .stream
            .create_consumer(config)
            .await
            .map_err(|e| anyhow::anyhow!("replay consumer: {e}"))?;

        let mut batch = consumer
            .fetch()
            .max_messages(max)
            .expires(REPLAY_EXPIRES)
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("replay fetch: {e}"))?;

        let mut out = Vec::new();
        while let Some(msg) = batch.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(err = %e, "replay message error");
                    break;
                }
            };
            if let Some(envelope) = decode_envelope(&msg) {
                out.push(envelope);
            }
        }
        Ok(out)
    }

    async fn log_head(&self) -> anyhow::Result<u64> {
        let stream = self
            .js
            .get_stream(subject::EVENTS_STREAM)
            .await
            .map_err(|e| anyhow::anyhow!("stream info: {e}"))?;
        Ok(stream.cached_info().state.last_sequence)
    }
}

struct NatsLogConsumer {
    consumer: async_nats::jetstream::consumer::Consumer<
        async_nats::jetstream::consumer::pull::Config,
    >,
}

#[async_trait]
impl LogConsumer for NatsLogConsumer {
    async fn fetch(&mut self, max: usize) -> anyhow::Result<Vec<PulledEvent>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("log fetch: {e}"))?;

        let mut out = Vec::new();
        while let Some(msg) = batch.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(err = %e, "log message error");
                    continue;
                }
            };
            match decode_envelope(&msg) {
                Some(envelope) => {
                    let deliveries = msg.info().map(|i| i.delivered as u64).unwrap_or(1);
                    out.push(PulledEvent::new(envelope, deliveries, Box::new(NatsAcker(msg))));
                }
                None => {
                    // Malformed payloads are acked away rather than
                    // redelivered forever.
                    if let Err(e) = msg.ack().await {
                        tracing::warn!("ack of malformed event failed: {e}");
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Decode an envelope from a JetStream message, stamping the stream
/// sequence over whatever the producer wrote.
fn decode_envelope(msg: &async_nats::jetstream::Message) -> Option<EventEnvelope> {
    let mut envelope: EventEnvelope = match serde_json::from_slice(&msg.payload) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(subject = %msg.subject, "malformed envelope: {e}");
            return None;
        }
    };
    if let Ok(info) = msg.info() {
        envelope.seq = info.stream_sequence;
    }
    Some(envelope)
}

struct NatsAcker(async_nats::jetstream::Message);

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(self: Box<Self>) -> anyhow::Result<()> {
        self.0.ack().await.map_err(|e| anyhow::anyhow!("ack: {e}"))
    }

    async fn nak(self: Box<Self>, delay: Option<Duration>) -> anyhow::Result<()> {
        self.0
            .ack_with(async_nats::jetstream::AckKind::Nak(delay))
            .await
            .map_err(|e| anyhow::anyhow!("nak: {e}"))
    }
}
