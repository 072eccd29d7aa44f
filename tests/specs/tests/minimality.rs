// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimality and ordering invariants checked across the full cluster:
//! one subscription per instance, one publish per interested instance,
//! per-channel order end to end, and dedup across a replay boundary.

use std::time::Duration;

use pulse_core::bus::Bus;
use pulse_core::dedup::DedupRing;
use pulse_core::frame::ServerFrame;
use pulse_core::subject;

use pulse_specs::{message, next_frame_where, Cluster};

/// One bus subscription for event delivery per instance, however many
/// users and channels it serves.
#[tokio::test]
async fn instance_holds_one_delivery_subscription() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    let before = cluster.bus.subscription_count().await;
    cluster.add_instance("n1").await;
    let after_instance = cluster.bus.subscription_count().await;
    assert_eq!(after_instance - before, 1, "one inbox subscription per instance");

    // Piling on users and channels adds no subscriptions.
    for user in 0..20 {
        for channel in 0..20 {
            cluster.dir.join(&format!("u{user}"), &format!("ch{channel}")).await;
        }
    }
    for user in 0..20 {
        cluster.connect("n1", &format!("u{user}"), "desktop").await?;
    }
    assert_eq!(cluster.bus.subscription_count().await, after_instance);
    Ok(())
}

/// One publish per distinct target instance, never per user.
#[tokio::test]
async fn fan_out_publishes_once_per_instance() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.add_instance("n2").await;
    // Five members on n1, two on n2, and one offline.
    for user in ["a1", "a2", "a3", "a4", "a5", "b1", "b2", "offline"] {
        cluster.dir.join(user, "ch_x").await;
    }
    for user in ["a1", "a2", "a3", "a4", "a5"] {
        cluster.connect("n1", user, "desktop").await?;
    }
    for user in ["b1", "b2"] {
        cluster.connect("n2", user, "desktop").await?;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut n1_inbox = cluster.bus.subscribe(&subject::instance_events("n1")).await?;
    let mut n2_inbox = cluster.bus.subscribe(&subject::instance_events("n2")).await?;
    cluster.send_message(&message("e1", "ch_x", "someone")).await?;

    for inbox in [&mut n1_inbox, &mut n2_inbox] {
        let msg = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .map_err(|_| anyhow::anyhow!("publish missing"))?
            .ok_or_else(|| anyhow::anyhow!("inbox closed"))?;
        let batch: pulse_core::envelope::EnvelopeBatch = serde_json::from_slice(&msg.payload)?;
        assert_eq!(batch.envelopes.iter().filter(|e| e.event_id == "e1").count(), 1);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(n1_inbox.try_recv().is_err());
    assert!(n2_inbox.try_recv().is_err());
    Ok(())
}

/// Per-channel order survives the whole pipeline even when two channels
/// interleave in the log.
#[tokio::test]
async fn per_channel_order_end_to_end() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.dir.join("alice", "ch_x").await;
    cluster.dir.join("alice", "ch_y").await;
    let alice = cluster.connect("n1", "alice", "desktop").await?;

    for i in 0..10 {
        let channel = if i % 2 == 0 { "ch_x" } else { "ch_y" };
        cluster.send_message(&message(&format!("e{i}"), channel, "bob")).await?;
    }

    let mut per_channel: std::collections::HashMap<String, Vec<u64>> =
        std::collections::HashMap::new();
    for _ in 0..10 {
        let frame =
            next_frame_where(&alice, |f| matches!(f, ServerFrame::MessageNew { .. })).await?;
        let ServerFrame::MessageNew { event } = frame else { unreachable!() };
        per_channel
            .entry(event.channel_id.unwrap_or_default())
            .or_default()
            .push(event.seq);
    }
    for (channel, seqs) in per_channel {
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "out-of-order delivery on {channel}: {seqs:?}"
        );
    }
    Ok(())
}

/// A client replaying across a checkpoint boundary observes each event
/// id at most once through its dedup ring.
#[tokio::test]
async fn replay_overlap_is_absorbed_by_the_client_ring() -> anyhow::Result<()> {
    let mut cluster = Cluster::start().await?;
    cluster.add_instance("n1").await;
    cluster.dir.join("alice", "ch_x").await;
    let alice = cluster.connect("n1", "alice", "desktop").await?;

    for i in 0..6 {
        cluster.send_message(&message(&format!("e{i}"), "ch_x", "bob")).await?;
    }

    // Live delivery first.
    let mut ring = DedupRing::new(1000);
    let mut observed = Vec::new();
    for _ in 0..6 {
        let frame =
            next_frame_where(&alice, |f| matches!(f, ServerFrame::MessageNew { .. })).await?;
        let ServerFrame::MessageNew { event } = frame else { unreachable!() };
        if ring.insert(&event.event_id) {
            observed.push(event.event_id);
        }
    }

    // A stale checkpoint makes the reconnect replay overlap everything.
    let n1 = cluster.instance("n1").ok_or_else(|| anyhow::anyhow!("n1 missing"))?;
    let frames = n1.catchup.run("alice", 0, pulse_core::now_ms() - 10_000).await?;
    for frame in frames {
        if let ServerFrame::SyncBatch { events, .. } = frame {
            for event in events {
                if ring.insert(&event.event_id) {
                    observed.push(event.event_id);
                }
            }
        }
    }

    observed.sort();
    let expected: Vec<String> = (0..6).map(|i| format!("e{i}")).collect();
    assert_eq!(observed, expected, "each event id observed exactly once");
    Ok(())
}
