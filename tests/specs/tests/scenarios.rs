// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end delivery scenarios across a full in-process cluster: one
//! router, several notification-server instances, real bus subjects.

use std::time::Duration;

use pulse_core::bus::Bus;
use pulse_core::envelope::{EventEnvelope, EventKind};
use pulse_core::frame::ServerFrame;
use pulse_core::kv::{get_json, Kv};
use pulse_core::record::{ReadPointer, UnreadCounters};
use pulse_core::{keys, now_ms, subject};
use pulse_notifier::readstate::ReadTarget;

use pulse_specs::{message, next_frame_where, wait_for, Cluster};

// ---------------------------------------------------------------------------
// baseline send/deliver
// ---------------------------------------------------------------------------

#[tokio::test]
async fn baseline_send_and_deliver() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.add_instance("n2").await;
    cluster.dir.join("alice", "ch_x").await;
    cluster.dir.join("bob", "ch_x").await;

    let alice = cluster.connect("n1", "alice", "desktop").await?;
    let bob = cluster.connect("n2", "bob", "desktop").await?;
    *alice.focused_channel.write() = Some("ch_x".into());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Watch both inboxes to count publishes.
    let mut n1_inbox = cluster.bus.subscribe(&subject::instance_events("n1")).await?;
    let mut n2_inbox = cluster.bus.subscribe(&subject::instance_events("n2")).await?;

    cluster.send_message(&message("e1", "ch_x", "alice")).await?;

    // Exactly one publish per interested instance (sync chatter from
    // the focused auto-read may follow; e1 itself must appear once).
    for inbox in [&mut n1_inbox, &mut n2_inbox] {
        let msg = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .map_err(|_| anyhow::anyhow!("publish missing"))?
            .ok_or_else(|| anyhow::anyhow!("inbox closed"))?;
        let batch: pulse_core::envelope::EnvelopeBatch = serde_json::from_slice(&msg.payload)?;
        assert_eq!(batch.envelopes.len(), 1);
        assert_eq!(batch.envelopes[0].event_id, "e1");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for inbox in [&mut n1_inbox, &mut n2_inbox] {
        while let Ok(msg) = inbox.try_recv() {
            let batch: pulse_core::envelope::EnvelopeBatch =
                serde_json::from_slice(&msg.payload)?;
            assert!(
                batch.envelopes.iter().all(|e| e.event_id != "e1"),
                "duplicate publish of e1"
            );
        }
    }

    // Both sessions receive the message.
    let frame =
        next_frame_where(&alice, |f| matches!(f, ServerFrame::MessageNew { .. })).await?;
    let ServerFrame::MessageNew { event } = frame else { unreachable!() };
    assert_eq!(event.event_id, "e1");
    next_frame_where(&bob, |f| matches!(f, ServerFrame::MessageNew { .. })).await?;

    // Alice was focused: her read pointer auto-advanced.
    let durable = std::sync::Arc::clone(&cluster.kv.durable);
    wait_for("alice read pointer", move || {
        let durable = std::sync::Arc::clone(&durable);
        async move {
            get_json::<ReadPointer>(durable.as_ref(), &keys::read_pointer("alice", "ch_x"))
                .await
                .ok()
                .flatten()
                .is_some_and(|p| p.event_id == "e1")
        }
    })
    .await?;

    // Bob was not: one unread for ch_x.
    let durable = std::sync::Arc::clone(&cluster.kv.durable);
    wait_for("bob unread", move || {
        let durable = std::sync::Arc::clone(&durable);
        async move {
            get_json::<UnreadCounters>(durable.as_ref(), &keys::unread("bob"))
                .await
                .ok()
                .flatten()
                .is_some_and(|c| c.channels.get("ch_x") == Some(&1))
        }
    })
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// typing echo suppression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn typing_echo_suppression_across_instances() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.add_instance("n2").await;
    cluster.add_instance("n3").await;
    cluster.dir.join("alice", "ch_x").await;
    cluster.dir.join("bob", "ch_x").await;

    let desktop = cluster.connect("n1", "alice", "desktop").await?;
    let mobile = cluster.connect("n3", "alice", "mobile").await?;
    let bob = cluster.connect("n2", "bob", "desktop").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    while desktop.outbound.pop().is_some() {}

    // Desktop starts typing: local delivery happens on n1; the bus
    // carries it to every other interested instance.
    let typing = EventEnvelope {
        event_id: "t1".into(),
        seq: 0,
        kind: EventKind::Typing,
        channel_id: Some("ch_x".into()),
        thread_id: None,
        origin_instance: Some("n1".into()),
        origin_session: Some(desktop.id.clone()),
        author: Some("alice".into()),
        also_send_to_channel: None,
        ts_ms: now_ms(),
        payload: serde_json::json!({ "active": true }),
    };
    cluster
        .bus
        .publish(&subject::typing("ch_x"), serde_json::to_vec(&typing)?.into())
        .await?;

    // Sibling device of the same user is still notified.
    let frame =
        next_frame_where(&mobile, |f| matches!(f, ServerFrame::Typing { .. })).await?;
    let ServerFrame::Typing { user, active, .. } = frame else { unreachable!() };
    assert_eq!(user, "alice");
    assert!(active);

    // Other members receive normally.
    next_frame_where(&bob, |f| matches!(f, ServerFrame::Typing { .. })).await?;

    // No echo back to the origin instance's sessions.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(frame) = desktop.outbound.pop() {
        assert!(!matches!(frame, ServerFrame::Typing { .. }), "typing echoed to origin");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// tier-2 catchup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tier2_catchup_after_five_minute_gap() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    for channel in ["ch_x", "ch_y", "ch_z"] {
        cluster.dir.join("alice", channel).await;
    }
    let n1 = cluster.instance("n1").ok_or_else(|| anyhow::anyhow!("n1 missing"))?;

    // Alice's active set is {ch_x, ch_y}; ch_z is not active.
    n1.catchup.touch_active_channel("alice", "ch_x").await?;
    n1.catchup.touch_active_channel("alice", "ch_y").await?;

    // She was at seq 0 when she disconnected. During the gap the
    // channels move: 10 events in ch_x, 3 in ch_y, 50 in ch_z.
    let mut last_seq = 0;
    for i in 0..10 {
        last_seq = cluster.send_message(&message(&format!("x{i}"), "ch_x", "bob")).await?;
    }
    for i in 0..3 {
        last_seq = cluster.send_message(&message(&format!("y{i}"), "ch_y", "bob")).await?;
    }
    for i in 0..50 {
        last_seq = cluster.send_message(&message(&format!("z{i}"), "ch_z", "bob")).await?;
    }

    // The fan-out consumer maintains her unread counters while offline.
    let durable = std::sync::Arc::clone(&cluster.kv.durable);
    wait_for("unread counted", move || {
        let durable = std::sync::Arc::clone(&durable);
        async move {
            get_json::<UnreadCounters>(durable.as_ref(), &keys::unread("alice"))
                .await
                .ok()
                .flatten()
                .is_some_and(|c| c.channels.get("ch_z") == Some(&50))
        }
    })
    .await?;

    // Reconnect after 5 minutes (tier 2), on a different instance.
    cluster.add_instance("n7").await;
    let n7 = cluster.instance("n7").ok_or_else(|| anyhow::anyhow!("n7 missing"))?;
    cluster.connect("n7", "alice", "desktop").await?;
    let disconnected_at = now_ms() - 300_000;
    let frames = n7.catchup.run("alice", 0, disconnected_at).await?;

    let ServerFrame::SyncPlan { tier, estimated_events, channels } = &frames[0] else {
        anyhow::bail!("expected plan first, got {:?}", frames[0]);
    };
    assert_eq!(*tier, 2);
    assert_eq!(*estimated_events, 13);
    assert_eq!(*channels, 2);

    let mut batch_channels = Vec::new();
    let mut saw_unread = false;
    for frame in &frames[1..] {
        match frame {
            ServerFrame::SyncBatch { channel, events } => {
                assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
                batch_channels.push(channel.clone());
            }
            ServerFrame::SyncUnread { entries, .. } => {
                saw_unread = true;
                let z = entries
                    .iter()
                    .find(|e| e.channel == "ch_z")
                    .ok_or_else(|| anyhow::anyhow!("ch_z missing from summary"))?;
                assert!(z.unread);
                assert_eq!(z.unread_count, 50);
            }
            ServerFrame::SyncComplete { last_event_seq } => {
                assert_eq!(*last_event_seq, last_seq);
            }
            other => anyhow::bail!("unexpected frame {other:?}"),
        }
    }
    batch_channels.sort();
    assert_eq!(batch_channels, vec!["ch_x", "ch_y"]);
    assert!(saw_unread);
    Ok(())
}

// ---------------------------------------------------------------------------
// thread reply, not-to-channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quiet_thread_reply_reaches_followers_not_members() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.add_instance("n2").await;
    cluster.add_instance("n4").await;
    for user in ["alice", "bob", "carol"] {
        cluster.dir.join(user, "ch_x").await;
    }
    cluster.dir.follow("alice", "t1").await;
    cluster.dir.follow("carol", "t1").await;

    let alice = cluster.connect("n1", "alice", "desktop").await?;
    let bob = cluster.connect("n2", "bob", "desktop").await?;
    let carol = cluster.connect("n4", "carol", "desktop").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut reply = message("r1", "ch_x", "carol");
    reply.kind = EventKind::ThreadReply;
    reply.thread_id = Some("t1".into());
    reply.also_send_to_channel = Some(false);
    reply.origin_instance = Some("n4".into());
    cluster.send_message(&reply).await?;

    // Follower on another instance gets the reply.
    next_frame_where(&alice, |f| matches!(f, ServerFrame::ThreadReply { .. })).await?;

    // Thread replies are content: the author's own session receives the
    // normal acknowledgement even though her instance is the origin.
    let frame =
        next_frame_where(&carol, |f| matches!(f, ServerFrame::ThreadReply { .. })).await?;
    let ServerFrame::ThreadReply { event } = frame else { unreachable!() };
    assert_eq!(event.event_id, "r1");

    // The reply-count update fans to all channel members.
    let mut updated = message("u1", "ch_x", "carol");
    updated.kind = EventKind::ThreadUpdated;
    updated.thread_id = Some("t1".into());
    cluster.send_message(&updated).await?;

    next_frame_where(&bob, |f| matches!(f, ServerFrame::ThreadUpdated { .. })).await?;

    // Bob never saw the reply itself.
    while let Some(frame) = bob.outbound.pop() {
        assert!(!matches!(frame, ServerFrame::ThreadReply { .. }), "reply leaked to non-follower");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// instance crash & reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crash_expires_routing_and_reconnect_rebuilds_it() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.dir.join("alice", "ch_x").await;
    cluster.connect("n1", "alice", "desktop").await?;
    assert_eq!(cluster.table.lookup("ch_x"), vec!["n1"]);

    // n1 crashes: no clean offline broadcast, only the presence record
    // aging out of KV.
    cluster.kv.presence.delete(&keys::presence_user("alice")).await?;
    let table = std::sync::Arc::clone(&cluster.table);
    wait_for("routing cleared", move || {
        let table = std::sync::Arc::clone(&table);
        async move { table.lookup("ch_x").is_empty() }
    })
    .await?;

    // Alice reconnects elsewhere; routing now includes n7.
    cluster.add_instance("n7").await;
    let session = cluster.connect("n7", "alice", "desktop").await?;
    assert_eq!(cluster.table.lookup("ch_x"), vec!["n7"]);

    // Within two minutes of the crash the gap selects log replay.
    let n7 = cluster.instance("n7").ok_or_else(|| anyhow::anyhow!("n7 missing"))?;
    let frames = n7.catchup.run("alice", 0, now_ms() - 60_000).await?;
    assert!(matches!(frames[0], ServerFrame::SyncPlan { tier: 1, .. }));

    // And delivery flows to the new instance.
    cluster.send_message(&message("e1", "ch_x", "bob")).await?;
    next_frame_where(&session, |f| matches!(f, ServerFrame::MessageNew { .. })).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// cross-device read sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_read_syncs_to_other_instance_only() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.add_instance("n7").await;
    cluster.dir.join("alice", "ch_x").await;

    let desktop = cluster.connect("n1", "alice", "desktop").await?;
    let mobile = cluster.connect("n7", "alice", "mobile").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    while desktop.outbound.pop().is_some() {}

    let n1 = cluster.instance("n1").ok_or_else(|| anyhow::anyhow!("n1 missing"))?;
    n1.readstate
        .mark_read("alice", &desktop.id, ReadTarget::Channel("ch_x".into()), "e77", 77)
        .await?;

    // Pointer landed in KV.
    let pointer: Option<ReadPointer> =
        get_json(cluster.kv.durable.as_ref(), &keys::read_pointer("alice", "ch_x")).await?;
    assert_eq!(pointer.map(|p| p.event_id), Some("e77".to_owned()));

    // The mobile session mirrors the read state.
    let frame =
        next_frame_where(&mobile, |f| matches!(f, ServerFrame::SyncRead { .. })).await?;
    let ServerFrame::SyncRead { event_id, channel, .. } = frame else { unreachable!() };
    assert_eq!(event_id, "e77");
    assert_eq!(channel.as_deref(), Some("ch_x"));

    // The originating session never sees its own sync.read.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(frame) = desktop.outbound.pop() {
        assert!(!matches!(frame, ServerFrame::SyncRead { .. }), "sync echoed to origin");
    }
    Ok(())
}
