// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket transport: handshake, per-session read/write tasks, and
//! the client-frame dispatch.
//!
//! The handshake consumes a one-time token (get-and-delete from KV), so
//! no long-lived credential ever crosses the streaming connection. Each
//! session runs a read task (this handler) and a write task draining
//! the outbound queue; `close` cancels both, drains pending writes
//! under a short deadline, and downgrades presence.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use pulse_core::bus::Bus;
use pulse_core::envelope::{EventEnvelope, EventKind};
use pulse_core::frame::{ClientFrame, ServerFrame};
use pulse_core::kv::Kv;
use pulse_core::record::PresenceChange;
use pulse_core::{keys, now_ms, subject};

use crate::error::CloseReason;
use crate::inbox;
use crate::readstate::ReadTarget;
use crate::session::Session;
use crate::state::Store;

const WS_AUTH_DEADLINE: Duration = Duration::from_secs(5);

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Identity carried by a one-time handshake token.
#[derive(Debug, Clone, Deserialize)]
struct TokenClaims {
    user: String,
    #[serde(default = "default_device")]
    device: String,
}

fn default_device() -> String {
    "unknown".to_owned()
}

/// Build the notifier's HTTP surface: the WebSocket endpoint plus
/// health, readiness, and metrics.
pub fn app_router(store: Arc<Store>) -> axum::Router {
    use axum::routing::get;

    let readiness = Arc::clone(&store);
    let mut router = axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/readyz",
            get(move || {
                let store = Arc::clone(&readiness);
                async move {
                    if store.accepting.load(Ordering::Acquire) {
                        (axum::http::StatusCode::OK, "ok")
                    } else {
                        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "paused")
                    }
                }
            }),
        );
    if let Some(prometheus) = crate::prometheus_handle() {
        router = router.route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        );
    }
    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(store)
}

/// WebSocket upgrade. Capacity and backpressure gates run before the
/// upgrade; token validation runs after, so the failure reason can be
/// delivered in-band.
pub async fn ws_handler(
    State(store): State<Arc<Store>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !store.can_accept().await {
        return axum::http::Response::builder()
            .status(503)
            .body(axum::body::Body::from("not accepting sessions"))
            .unwrap_or_default()
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(store, socket, query.token))
        .into_response()
}

type WsTx = SplitSink<WebSocket, Message>;
type WsRx = SplitStream<WebSocket>;

async fn handle_connection(store: Arc<Store>, socket: WebSocket, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let claims = match authenticate(&store, token, &mut ws_rx).await {
        Ok(claims) => claims,
        Err(reason) => {
            // No session state exists yet; report and close.
            let frame = ServerFrame::SessionTerminated { reason: reason.as_str().to_owned() };
            let _ = send_json(&mut ws_tx, &frame).await;
            metrics::counter!("pulse_handshake_failures_total").increment(1);
            return;
        }
    };

    let channels = match store.membership.channels_for_user(&claims.user).await {
        Ok(channels) => channels,
        Err(e) => {
            warn!(user = %claims.user, "membership fetch failed at handshake: {e}");
            Vec::new()
        }
    };

    let session = Arc::new(Session::new(
        &claims.user,
        &claims.device,
        store.config.session_outbound_queue_size,
    ));
    store.registry.register(Arc::clone(&session), channels).await;
    session.deliver(ServerFrame::AuthOk { session_id: session.id.clone() });
    publish_presence(&store, &claims.user).await;
    metrics::gauge!("pulse_sessions").set(store.registry.len().await as f64);
    info!(user = %claims.user, session = %session.id, "session opened");

    let writer = tokio::spawn(write_loop(Arc::clone(&store), Arc::clone(&session), ws_tx));

    loop {
        let msg = tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = store.shutdown.cancelled() => {
                store.request_close(&session, CloseReason::Shutdown);
                break;
            }
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                let frame: ClientFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(session = %session.id, "malformed frame: {e}");
                        store.request_close(&session, CloseReason::Protocol);
                        break;
                    }
                };
                if let Err(reason) = handle_frame(&store, &session, frame).await {
                    store.request_close(&session, reason);
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(_)) => break,
            _ => {}
        }
    }

    session.cancel.cancel();
    let _ = writer.await;
    teardown(&store, &session).await;
}

/// Resolve the handshake token: from the connect URL, or the first
/// `ws_auth` frame within the deadline. The KV take is atomic, so a
/// replayed token loses.
async fn authenticate(
    store: &Store,
    token: Option<String>,
    ws_rx: &mut WsRx,
) -> Result<TokenClaims, CloseReason> {
    let token = match token {
        Some(token) => token,
        None => wait_for_ws_auth(ws_rx).await?,
    };
    let bytes = store
        .kv
        .tokens
        .take(&keys::ws_token(&token))
        .await
        .map_err(|_| CloseReason::Auth)?
        .ok_or(CloseReason::Auth)?;
    serde_json::from_slice(&bytes).map_err(|_| CloseReason::Auth)
}

async fn wait_for_ws_auth(ws_rx: &mut WsRx) -> Result<String, CloseReason> {
    let msg = tokio::time::timeout(WS_AUTH_DEADLINE, ws_rx.next())
        .await
        .map_err(|_| CloseReason::Auth)?;
    match msg {
        Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
            Ok(ClientFrame::WsAuth { token }) => Ok(token),
            _ => Err(CloseReason::Auth),
        },
        _ => Err(CloseReason::Auth),
    }
}

/// Apply one client frame. An `Err` closes the session with the reason.
async fn handle_frame(
    store: &Arc<Store>,
    session: &Arc<Session>,
    frame: ClientFrame,
) -> Result<(), CloseReason> {
    match frame {
        ClientFrame::Heartbeat { state, focused_channel } => {
            session.touch_heartbeat();
            let changed = {
                let mut current = session.state.write();
                let changed = *current != state;
                *current = state;
                changed
            };
            *session.focused_channel.write() = focused_channel;
            if changed {
                publish_presence(store, &session.user).await;
            } else if let Err(e) = store.presence.refresh(&store.registry, &session.user).await {
                debug!(user = %session.user, "presence refresh failed: {e}");
            }
        }
        ClientFrame::ChannelFocus { channel } => {
            *session.focused_channel.write() = Some(channel.clone());
            if let Err(e) =
                store.readstate.focus_advance(&session.user, &session.id, &channel).await
            {
                debug!(channel = %channel, "focus auto-read failed: {e}");
            }
            if let Err(e) = store.catchup.touch_active_channel(&session.user, &channel).await {
                debug!(channel = %channel, "active-channel touch failed: {e}");
            }
        }
        ClientFrame::ChannelBlur { channel } => {
            let mut focused = session.focused_channel.write();
            if focused.as_deref() == Some(channel.as_str()) {
                *focused = None;
            }
        }
        ClientFrame::MarkRead { channel, thread, event_id, seq } => {
            let target = match (channel, thread) {
                (Some(channel), _) => ReadTarget::Channel(channel),
                (None, Some(thread)) => ReadTarget::Thread(thread),
                (None, None) => return Err(CloseReason::Protocol),
            };
            if let Err(e) = store
                .readstate
                .mark_read(&session.user, &session.id, target, &event_id, seq)
                .await
            {
                debug!(user = %session.user, "mark_read failed: {e}");
            }
        }
        ClientFrame::TypingStart { channel } => {
            send_typing(store, session, &channel, true).await;
        }
        ClientFrame::TypingStop { channel } => {
            send_typing(store, session, &channel, false).await;
        }
        ClientFrame::DraftUpdate { channel, text } => {
            if let Err(e) =
                store.readstate.draft(&session.user, &session.id, &channel, &text).await
            {
                debug!(channel = %channel, "draft sync failed: {e}");
            }
        }
        ClientFrame::SyncRequest { last_event_seq, disconnected_at_ms } => {
            run_catchup(store, session, last_event_seq, disconnected_at_ms).await;
        }
        ClientFrame::WsAuth { .. } => {
            // Already authenticated; a second token is a protocol fault.
            return Err(CloseReason::Protocol);
        }
    }
    Ok(())
}

/// Emit a typing indicator: local members immediately, remote instances
/// through the bus (the router excludes this instance on fan-out).
async fn send_typing(store: &Arc<Store>, session: &Arc<Session>, channel: &str, active: bool) {
    let envelope = EventEnvelope {
        event_id: uuid::Uuid::new_v4().to_string(),
        seq: 0,
        kind: EventKind::Typing,
        channel_id: Some(channel.to_owned()),
        thread_id: None,
        origin_instance: Some(store.instance.clone()),
        origin_session: Some(session.id.clone()),
        author: Some(session.user.clone()),
        also_send_to_channel: None,
        ts_ms: now_ms(),
        payload: serde_json::json!({ "active": active }),
    };
    inbox::dispatch(store, envelope.clone()).await;
    match serde_json::to_vec(&envelope) {
        Ok(payload) => {
            if let Err(e) = store.bus.publish(&subject::typing(channel), payload.into()).await {
                debug!(channel, "typing publish failed: {e}");
            }
        }
        Err(e) => debug!("typing encode failed: {e}"),
    }
}

/// Run the reconnection engine under the catchup deadline; on overrun
/// the client is told to take the full-refresh path instead.
async fn run_catchup(
    store: &Arc<Store>,
    session: &Arc<Session>,
    last_event_seq: u64,
    disconnected_at_ms: u64,
) {
    let deadline = store.config.catchup_deadline();
    let result = tokio::time::timeout(
        deadline,
        store.catchup.run(&session.user, last_event_seq, disconnected_at_ms),
    )
    .await;

    let frames = match result {
        Ok(Ok(frames)) => frames,
        Ok(Err(e)) => {
            warn!(user = %session.user, "catchup failed: {e}");
            fallback_refresh_frames(store, last_event_seq).await
        }
        Err(_) => {
            warn!(user = %session.user, "catchup deadline exceeded, downgrading to refresh");
            fallback_refresh_frames(store, last_event_seq).await
        }
    };

    for frame in frames {
        let seq = frame_seq(&frame);
        if session.deliver(frame) == crate::session::Enqueued::Overflow {
            store.request_close(session, CloseReason::QueueOverflow);
            return;
        }
        session.note_delivered(seq);
    }
    if let Err(e) = store
        .catchup
        .checkpoint(&session.user, session.last_delivered_seq.load(Ordering::Acquire))
        .await
    {
        debug!(user = %session.user, "post-catchup checkpoint failed: {e}");
    }
}

/// Minimal T4-style reply when catchup itself cannot complete.
async fn fallback_refresh_frames(store: &Arc<Store>, last_event_seq: u64) -> Vec<ServerFrame> {
    let head = store.bus.log_head().await.unwrap_or(last_event_seq).max(last_event_seq);
    vec![
        ServerFrame::SyncPlan { tier: 4, estimated_events: 0, channels: 0 },
        ServerFrame::SyncComplete { last_event_seq: head },
    ]
}

/// Log sequence a frame advances the session to, if any.
fn frame_seq(frame: &ServerFrame) -> u64 {
    match frame {
        ServerFrame::MessageNew { event }
        | ServerFrame::MessageEdited { event }
        | ServerFrame::MessageDeleted { event }
        | ServerFrame::MessageReaction { event }
        | ServerFrame::ThreadReply { event }
        | ServerFrame::ThreadUpdated { event } => event.seq,
        ServerFrame::SyncBatch { events, .. } => events.last().map(|e| e.seq).unwrap_or(0),
        ServerFrame::SyncComplete { last_event_seq } => *last_event_seq,
        _ => 0,
    }
}

/// Per-session writer: drains the outbound queue to the socket and
/// checkpoints on the delivered-event threshold. On cancel, pending
/// frames are flushed under the drain deadline so `session.terminated`
/// beats the socket close.
async fn write_loop(store: Arc<Store>, session: Arc<Session>, mut ws_tx: WsTx) {
    loop {
        while let Some(frame) = session.outbound.pop() {
            if send_json(&mut ws_tx, &frame).await.is_err() {
                session.cancel.cancel();
                return;
            }
        }

        if session.delivered_since_checkpoint.load(Ordering::Relaxed)
            >= store.config.checkpoint_events
        {
            session.delivered_since_checkpoint.store(0, Ordering::Relaxed);
            let seq = session.last_delivered_seq.load(Ordering::Acquire);
            if let Err(e) = store.catchup.checkpoint(&session.user, seq).await {
                debug!(user = %session.user, "checkpoint failed: {e}");
            }
        }

        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = session.outbound.ready() => {}
        }
    }

    // Drain what is already queued, bounded by the drain deadline.
    let deadline = tokio::time::Instant::now() + store.config.shutdown_drain();
    while let Some(frame) = session.outbound.pop() {
        let send = send_json(&mut ws_tx, &frame);
        if tokio::time::timeout_at(deadline, send).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn send_json(ws_tx: &mut WsTx, frame: &ServerFrame) -> anyhow::Result<()> {
    let text = serde_json::to_string(frame)?;
    ws_tx.send(Message::Text(text.into())).await.map_err(|e| anyhow::anyhow!("ws send: {e}"))
}

/// Close bookkeeping: deregister, downgrade presence, final checkpoint.
async fn teardown(store: &Arc<Store>, session: &Arc<Session>) {
    store.registry.deregister(&session.id).await;
    publish_presence(store, &session.user).await;
    let seq = session.last_delivered_seq.load(Ordering::Acquire);
    if seq > 0 {
        if let Err(e) = store.catchup.checkpoint(&session.user, seq).await {
            debug!(user = %session.user, "final checkpoint failed: {e}");
        }
    }
    metrics::gauge!("pulse_sessions").set(store.registry.len().await as f64);
    info!(user = %session.user, session = %session.id, "session closed");
}

/// Publish the user's presence change and mirror it to local sessions
/// (the router's broadcast excludes this instance).
async fn publish_presence(store: &Arc<Store>, user: &str) {
    let change = match store.presence.update(&store.registry, user).await {
        Ok(change) => change,
        Err(e) => {
            debug!(user, "presence update failed: {e}");
            return;
        }
    };
    inbox::dispatch(store, presence_envelope(&change)).await;
}

fn presence_envelope(change: &PresenceChange) -> EventEnvelope {
    EventEnvelope {
        event_id: format!("pr-{}-{}", change.user, change.seq),
        seq: 0,
        kind: EventKind::Presence,
        channel_id: None,
        thread_id: None,
        origin_instance: Some(change.instance.clone()),
        origin_session: None,
        author: Some(change.user.clone()),
        also_send_to_channel: None,
        ts_ms: change.ts_ms,
        payload: serde_json::json!({ "state": change.state }),
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
