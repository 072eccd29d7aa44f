// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::Ordering;

use super::*;
use pulse_core::envelope::{EventEnvelope, EventKind};

fn message_frame(id: &str) -> ServerFrame {
    ServerFrame::MessageNew {
        event: EventEnvelope {
            event_id: id.into(),
            seq: 1,
            kind: EventKind::MessageNew,
            channel_id: Some("ch".into()),
            thread_id: None,
            origin_instance: None,
            origin_session: None,
            author: None,
            also_send_to_channel: None,
            ts_ms: 0,
            payload: serde_json::Value::Null,
        },
    }
}

fn typing_frame() -> ServerFrame {
    ServerFrame::Typing { channel: "ch".into(), user: "u".into(), active: true, ts_ms: 0 }
}

#[test]
fn fifo_under_capacity() {
    let queue = OutboundQueue::new(4);
    assert_eq!(queue.push(message_frame("e1")), Enqueued::Ok);
    assert_eq!(queue.push(typing_frame()), Enqueued::Ok);
    assert!(matches!(queue.pop(), Some(ServerFrame::MessageNew { .. })));
    assert!(matches!(queue.pop(), Some(ServerFrame::Typing { .. })));
    assert!(queue.pop().is_none());
}

#[test]
fn overflow_sheds_oldest_ephemeral_first() {
    let queue = OutboundQueue::new(2);
    queue.push(typing_frame());
    queue.push(message_frame("e1"));

    // Full; the typing frame goes, the message survives.
    assert_eq!(queue.push(message_frame("e2")), Enqueued::DroppedEphemeral);
    assert_eq!(queue.len(), 2);
    let ids: Vec<bool> =
        std::iter::from_fn(|| queue.pop()).map(|f| matches!(f, ServerFrame::MessageNew { .. })).collect();
    assert_eq!(ids, vec![true, true]);
}

#[test]
fn incoming_ephemeral_dropped_when_full_of_messages() {
    let queue = OutboundQueue::new(2);
    queue.push(message_frame("e1"));
    queue.push(message_frame("e2"));
    assert_eq!(queue.push(typing_frame()), Enqueued::DroppedEphemeral);
    assert_eq!(queue.len(), 2);
}

#[test]
fn overflow_of_undroppable_frames_reports_overflow() {
    let queue = OutboundQueue::new(2);
    queue.push(message_frame("e1"));
    queue.push(message_frame("e2"));
    // Messages and sync frames are never dropped; the session must close.
    assert_eq!(queue.push(message_frame("e3")), Enqueued::Overflow);
    assert_eq!(queue.len(), 2);
}

#[test]
fn delivered_seq_is_monotonic() {
    let session = Session::new("alice", "desktop", 8);
    session.note_delivered(10);
    session.note_delivered(7); // replay overlap must not rewind
    assert_eq!(session.last_delivered_seq.load(Ordering::Acquire), 10);
    assert_eq!(session.delivered_since_checkpoint.load(Ordering::Relaxed), 2);

    session.note_delivered(0); // unsequenced ephemeral event
    assert_eq!(session.delivered_since_checkpoint.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn ready_wakes_consumer() {
    let queue = std::sync::Arc::new(OutboundQueue::new(4));
    let consumer = {
        let queue = std::sync::Arc::clone(&queue);
        tokio::spawn(async move {
            loop {
                if let Some(frame) = queue.pop() {
                    return frame;
                }
                queue.ready().await;
            }
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    queue.push(message_frame("e1"));
    let frame = tokio::time::timeout(std::time::Duration::from_secs(1), consumer)
        .await
        .ok()
        .and_then(Result::ok);
    assert!(matches!(frame, Some(ServerFrame::MessageNew { .. })));
}
