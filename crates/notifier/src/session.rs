// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One client session: identity, device state, and the bounded outbound
//! queue feeding its single writer task.
//!
//! The queue has one producer (the instance dispatcher) and one consumer
//! (the session's write loop). On overflow, the oldest ephemeral frame
//! (typing, presence) is dropped first; if nothing is droppable the
//! enqueue reports overflow and the caller closes the session, letting
//! the client recover through catchup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use pulse_core::frame::{ClientState, ServerFrame};

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Ok,
    /// Queue was full; an older ephemeral frame was dropped to make room.
    DroppedEphemeral,
    /// Queue is full of undroppable frames; the session must close.
    Overflow,
}

/// Bounded outbound frame queue.
pub struct OutboundQueue {
    frames: parking_lot::Mutex<VecDeque<ServerFrame>>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: parking_lot::Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, frame: ServerFrame) -> Enqueued {
        let mut frames = self.frames.lock();
        if frames.len() < self.capacity {
            frames.push_back(frame);
            drop(frames);
            self.notify.notify_one();
            return Enqueued::Ok;
        }

        // Full: shed the oldest ephemeral frame first.
        if let Some(pos) = frames.iter().position(ServerFrame::is_droppable) {
            frames.remove(pos);
            frames.push_back(frame);
            drop(frames);
            self.notify.notify_one();
            return Enqueued::DroppedEphemeral;
        }
        if frame.is_droppable() {
            // Nothing older to shed, but the incoming frame itself is
            // ephemeral: drop it instead of killing the session.
            return Enqueued::DroppedEphemeral;
        }
        Enqueued::Overflow
    }

    pub fn pop(&self) -> Option<ServerFrame> {
        self.frames.lock().pop_front()
    }

    /// Wait until a frame is (probably) available.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

/// A connected client session.
pub struct Session {
    pub id: String,
    pub user: String,
    pub device: String,
    pub state: parking_lot::RwLock<ClientState>,
    pub focused_channel: parking_lot::RwLock<Option<String>>,
    pub last_heartbeat: parking_lot::Mutex<Instant>,
    /// Highest log sequence delivered to this session.
    pub last_delivered_seq: AtomicU64,
    /// Deliveries since the last checkpoint write.
    pub delivered_since_checkpoint: AtomicU64,
    pub outbound: OutboundQueue,
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(user: &str, device: &str, queue_size: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.to_owned(),
            device: device.to_owned(),
            state: parking_lot::RwLock::new(ClientState::Active),
            focused_channel: parking_lot::RwLock::new(None),
            last_heartbeat: parking_lot::Mutex::new(Instant::now()),
            last_delivered_seq: AtomicU64::new(0),
            delivered_since_checkpoint: AtomicU64::new(0),
            outbound: OutboundQueue::new(queue_size),
            cancel: CancellationToken::new(),
        }
    }

    /// Enqueue a frame for delivery; returns the queue outcome.
    pub fn deliver(&self, frame: ServerFrame) -> Enqueued {
        self.outbound.push(frame)
    }

    /// Record a delivered log sequence (monotonic; replays do not move
    /// it backward).
    pub fn note_delivered(&self, seq: u64) {
        if seq == 0 {
            return;
        }
        self.last_delivered_seq.fetch_max(seq, Ordering::AcqRel);
        self.delivered_since_checkpoint.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> std::time::Duration {
        self.last_heartbeat.lock().elapsed()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
