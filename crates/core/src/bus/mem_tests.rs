// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use bytes::Bytes;

use super::*;
use crate::envelope::{EventEnvelope, EventKind};
use crate::subject;

fn envelope(id: &str, channel: &str) -> EventEnvelope {
    EventEnvelope {
        event_id: id.into(),
        seq: 0,
        kind: EventKind::MessageNew,
        channel_id: Some(channel.into()),
        thread_id: None,
        origin_instance: None,
        origin_session: None,
        author: Some("alice".into()),
        also_send_to_channel: None,
        ts_ms: 1,
        payload: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn publish_reaches_matching_subscribers() -> anyhow::Result<()> {
    let bus = MemBus::new();
    let mut typing = bus.subscribe(subject::TYPING_WILDCARD).await?;
    let mut other = bus.subscribe("presence.changed.>").await?;

    bus.publish(&subject::typing("ch_x"), Bytes::from_static(b"{}")).await?;

    let msg = typing.try_recv()?;
    assert_eq!(msg.subject, "typing.ch_x");
    assert!(other.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn log_assigns_monotonic_sequences() -> anyhow::Result<()> {
    let bus = MemBus::new();
    let s1 = bus.log_publish(&subject::message("send", "ch"), &envelope("e1", "ch")).await?;
    let s2 = bus.log_publish(&subject::message("send", "ch"), &envelope("e2", "ch")).await?;
    assert_eq!((s1, s2), (1, 2));
    assert_eq!(bus.log_len().await, 2);
    Ok(())
}

#[tokio::test]
async fn consumer_fetches_in_order_with_filters() -> anyhow::Result<()> {
    let bus = MemBus::new();
    bus.log_publish(&subject::message("send", "ch"), &envelope("e1", "ch")).await?;
    bus.log_publish(&subject::member("join", "ch"), &envelope("e2", "ch")).await?;
    bus.log_publish(&subject::message("edit", "ch"), &envelope("e3", "ch")).await?;

    let mut consumer = bus.log_consumer("fanout", &["messages.>".to_owned()]).await?;
    let batch = consumer.fetch(10).await?;
    let ids: Vec<&str> = batch.iter().map(|p| p.envelope.event_id.as_str()).collect();
    assert_eq!(ids, vec!["e1", "e3"]);
    assert_eq!(batch[0].envelope.seq, 1);
    assert_eq!(batch[1].envelope.seq, 3);

    for event in batch {
        event.ack().await?;
    }
    assert!(consumer.fetch(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn nak_causes_redelivery() -> anyhow::Result<()> {
    let bus = MemBus::new();
    bus.log_publish(&subject::message("send", "ch"), &envelope("e1", "ch")).await?;

    let mut consumer = bus.log_consumer("fanout", &["messages.>".to_owned()]).await?;
    let mut batch = consumer.fetch(10).await?;
    let event = batch.remove(0);
    event.nak(None).await?;

    let batch = consumer.fetch(10).await?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].envelope.event_id, "e1");
    Ok(())
}

#[tokio::test]
async fn replay_starts_after_sequence() -> anyhow::Result<()> {
    let bus = MemBus::new();
    for i in 1..=5 {
        bus.log_publish(&subject::message("send", "ch"), &envelope(&format!("e{i}"), "ch"))
            .await?;
    }
    let replay = bus.log_replay(3, 10).await?;
    let ids: Vec<&str> = replay.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec!["e4", "e5"]);

    let bounded = bus.log_replay(0, 2).await?;
    assert_eq!(bounded.len(), 2);
    Ok(())
}
