// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbox subscriber — the instance's single bus subscription for event
//! delivery (`instance.events.{self}`), plus the dispatch logic that
//! turns envelopes into per-session frames.
//!
//! Dispatch is single-tasked, so per-channel publish order carries
//! straight through to each session's FIFO queue. The same dispatch
//! functions serve locally originated events (typing, presence) so the
//! origin instance delivers to its own sessions without a bus
//! round-trip.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_core::bus::Bus;
use pulse_core::envelope::{EnvelopeBatch, EventEnvelope, EventKind};
use pulse_core::frame::ServerFrame;
use pulse_core::subject;
use pulse_core::sync::SyncEvent;

use crate::error::CloseReason;
use crate::session::{Enqueued, Session};
use crate::state::Store;

/// Run the inbox loop until shutdown. Holds exactly one subscription.
pub async fn run(store: Arc<Store>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let inbox_subject = subject::instance_events(&store.instance);
    let mut sub = store.bus.subscribe(&inbox_subject).await?;
    info!(subject = %inbox_subject, "inbox subscribed");

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = sub.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };

        // Backpressure gate: refuse new sessions while the backlog is
        // deep; resume at half the threshold.
        let backlog = sub.len();
        metrics::gauge!("pulse_inbox_backlog").set(backlog as f64);
        if backlog > store.config.inbox_lag_threshold {
            if store.accepting.swap(false, Ordering::AcqRel) {
                warn!(backlog, "inbox lag over threshold, refusing new sessions");
            }
        } else if backlog < store.config.inbox_lag_threshold / 2
            && !store.accepting.swap(true, Ordering::AcqRel)
        {
            info!(backlog, "inbox backlog recovered, accepting sessions");
        }

        let batch: EnvelopeBatch = match serde_json::from_slice(&msg.payload) {
            Ok(b) => b,
            Err(e) => {
                debug!("malformed inbox batch: {e}");
                continue;
            }
        };
        for envelope in batch.envelopes {
            dispatch(&store, envelope).await;
        }
    }

    info!("inbox stopped");
    Ok(())
}

/// Deliver one envelope to the right local sessions.
pub async fn dispatch(store: &Store, envelope: EventEnvelope) {
    if !envelope.kind.is_ephemeral() {
        let fresh = store.dedup.lock().await.insert(&envelope.event_id);
        if !fresh {
            metrics::counter!("pulse_inbox_duplicates_total").increment(1);
            return;
        }
    }
    metrics::counter!("pulse_inbox_events_total").increment(1);

    match envelope.kind {
        EventKind::MemberJoin | EventKind::MemberLeave => {
            apply_membership(store, &envelope).await;
        }
        EventKind::UserSync => deliver_sync(store, &envelope).await,
        EventKind::Presence => deliver_presence(store, &envelope).await,
        EventKind::Typing => deliver_typing(store, &envelope).await,
        EventKind::ThreadReply if !envelope.also_send_to_channel.unwrap_or(false) => {
            deliver_thread_reply(store, envelope).await;
        }
        _ => deliver_channel(store, envelope).await,
    }
}

async fn apply_membership(store: &Store, envelope: &EventEnvelope) {
    let (Some(user), Some(channel)) =
        (envelope.author.as_deref(), envelope.channel_id.as_deref())
    else {
        return;
    };
    match envelope.kind {
        EventKind::MemberJoin => store.registry.apply_join(user, channel).await,
        EventKind::MemberLeave => store.registry.apply_leave(user, channel).await,
        _ => {}
    }
}

/// Channel events: every local session of every local member, in order.
/// A session focused on the channel has effectively read the event, so
/// its user's read pointer auto-advances.
async fn deliver_channel(store: &Store, envelope: EventEnvelope) {
    let Some(channel) = envelope.channel_id.clone() else {
        return;
    };
    let seq = envelope.seq;
    let event_id = envelope.event_id.clone();
    let auto_read = envelope.kind.counts_unread();
    let Some(frame) = ServerFrame::from_envelope(envelope) else {
        return;
    };
    for user in store.registry.users_in_channel(&channel).await {
        let mut focused_session: Option<String> = None;
        for session in store.registry.sessions_for_user(&user).await {
            if focused_session.is_none()
                && session.focused_channel.read().as_deref() == Some(channel.as_str())
            {
                focused_session = Some(session.id.clone());
            }
            send_frame(store, &session, frame.clone(), seq);
        }
        if auto_read {
            if let Some(session_id) = focused_session {
                if let Err(e) = store
                    .readstate
                    .mark_read(
                        &user,
                        &session_id,
                        crate::readstate::ReadTarget::Channel(channel.clone()),
                        &event_id,
                        seq,
                    )
                    .await
                {
                    debug!(user = %user, "focused auto-read failed: {e}");
                }
            }
        }
    }
}

/// Thread replies not sent to the channel go to local followers only.
async fn deliver_thread_reply(store: &Store, envelope: EventEnvelope) {
    let Some(thread) = envelope.thread_id.clone() else {
        return deliver_channel(store, envelope).await;
    };
    let followers = match store.thread_followers(&thread).await {
        Ok(f) => f,
        Err(e) => {
            debug!(thread = %thread, "follower lookup failed: {e}");
            return;
        }
    };
    let seq = envelope.seq;
    let Some(frame) = ServerFrame::from_envelope(envelope) else {
        return;
    };
    for user in followers {
        for session in store.registry.sessions_for_user(&user).await {
            send_frame(store, &session, frame.clone(), seq);
        }
    }
}

/// An indicator older than this is noise by the time it arrives.
const TYPING_STALE_MS: u64 = 10_000;

/// Typing: local members of the channel, skipping the originating
/// session (sibling devices of the same user still get it).
async fn deliver_typing(store: &Store, envelope: &EventEnvelope) {
    let Some(channel) = envelope.channel_id.clone() else {
        return;
    };
    if pulse_core::now_ms().saturating_sub(envelope.ts_ms) > TYPING_STALE_MS {
        return;
    }
    let origin_session = envelope.origin_session.clone();
    let Some(frame) = ServerFrame::from_envelope(envelope.clone()) else {
        return;
    };
    for user in store.registry.users_in_channel(&channel).await {
        for session in store.registry.sessions_for_user(&user).await {
            if origin_session.as_deref() == Some(session.id.as_str()) {
                continue;
            }
            send_frame(store, &session, frame.clone(), 0);
        }
    }
}

/// Presence: every local session except the user's own. The router
/// already scoped the publish to instances sharing a channel.
async fn deliver_presence(store: &Store, envelope: &EventEnvelope) {
    let presence_user = envelope.author.clone().unwrap_or_default();
    let Some(frame) = ServerFrame::from_envelope(envelope.clone()) else {
        return;
    };
    for session in store.registry.all_sessions().await {
        if session.user == presence_user {
            continue;
        }
        send_frame(store, &session, frame.clone(), 0);
    }
}

/// Cross-device sync: the user's sessions minus the originator.
async fn deliver_sync(store: &Store, envelope: &EventEnvelope) {
    let Some(user) = envelope.target_user() else {
        return;
    };
    let event: SyncEvent = match serde_json::from_value(envelope.payload.clone()) {
        Ok(e) => e,
        Err(e) => {
            debug!("malformed sync payload: {e}");
            return;
        }
    };
    let frame = match event {
        SyncEvent::Read { channel, thread, event_id } => {
            ServerFrame::SyncRead { channel, thread, event_id }
        }
        SyncEvent::Draft { channel, text } => ServerFrame::SyncDraft { channel, text },
        SyncEvent::Badge { total, mentions } => {
            ServerFrame::SyncUnread { entries: vec![], total, mentions }
        }
    };
    let origin = envelope.origin_session.as_deref().unwrap_or("");
    for session in store.registry.sessions_for_user(user).await {
        if session.id == origin {
            continue;
        }
        send_frame(store, &session, frame.clone(), 0);
    }
}

/// Enqueue one frame, applying the overflow policy.
fn send_frame(store: &Store, session: &Arc<Session>, frame: ServerFrame, seq: u64) {
    match session.deliver(frame) {
        Enqueued::Ok => session.note_delivered(seq),
        Enqueued::DroppedEphemeral => {
            metrics::counter!("pulse_session_dropped_frames_total").increment(1);
            session.note_delivered(seq);
        }
        Enqueued::Overflow => {
            warn!(session = %session.id, user = %session.user, "outbound queue overflow, closing");
            metrics::counter!("pulse_session_overflow_closes_total").increment(1);
            store.request_close(session, CloseReason::QueueOverflow);
        }
    }
}

#[cfg(test)]
#[path = "inbox_tests.rs"]
mod tests;
