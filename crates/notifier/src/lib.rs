// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pulse notification server: holds client WebSocket sessions, receives
//! per-instance deliveries from the fan-out router, and serves
//! reconnection catchup.

pub mod catchup;
pub mod config;
pub mod error;
pub mod inbox;
pub mod presence;
pub mod readstate;
pub mod registry;
pub mod session;
pub mod state;
pub mod test_support;
pub mod ws;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pulse_core::kv::{put_json, Kv};
use pulse_core::record::InstanceRecord;
use pulse_core::{keys, now_ms};

use crate::config::Config;
use crate::error::CloseReason;
use crate::state::{NotifierDeps, Store};

/// Initialize tracing from the config. Priority: --log-level /
/// PULSE_LOG_LEVEL > RUST_LOG > "info".
pub fn init_tracing(log_format: &str, log_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if std::env::var("PULSE_LOG_LEVEL").is_err() && log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    } else {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match log_format {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Process-wide Prometheus recorder; the first caller installs it.
pub(crate) fn prometheus_handle(
) -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    static HANDLE: OnceLock<Option<metrics_exporter_prometheus::PrometheusHandle>> =
        OnceLock::new();
    HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder().ok()
        })
        .clone()
}

/// Run the notification server until shutdown.
pub async fn run(
    config: Config,
    deps: NotifierDeps,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let instance = acquire_instance_id(&config, deps.kv.presence.as_ref()).await?;
    info!(instance = %instance, "instance id acquired");

    let store = Arc::new(Store::new(config, instance, deps, shutdown.clone()));

    let inbox_task = {
        let store = Arc::clone(&store);
        let sd = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = inbox::run(store, sd).await {
                tracing::error!(err = %e, "inbox failed");
            }
        })
    };
    spawn_instance_heartbeat(Arc::clone(&store), shutdown.clone());
    spawn_session_watchdog(Arc::clone(&store), shutdown.clone());

    let addr = format!("{}:{}", store.config.host, store.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "pulse-notifier listening");

    // Graceful teardown runs as soon as shutdown fires, so clients get
    // session.terminated before their sockets close.
    {
        let store = Arc::clone(&store);
        let sd = shutdown.clone();
        tokio::spawn(async move {
            sd.cancelled().await;
            graceful_teardown(&store).await;
        });
    }

    let router = ws::app_router(Arc::clone(&store));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    let _ = inbox_task.await;
    Ok(())
}

/// Resolve and register the instance id. A colliding live registration
/// is a startup failure.
pub async fn acquire_instance_id(config: &Config, kv: &dyn Kv) -> anyhow::Result<String> {
    let id = match config.instance_id_strategy.as_str() {
        "explicit" | "env" => config
            .instance_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("instance id not configured"))?,
        _ => config.instance_id.clone().unwrap_or_else(hostname_id),
    };

    if kv.get(&keys::instance(&id)).await?.is_some() {
        anyhow::bail!("instance id {id} is already registered");
    }
    let record = InstanceRecord { instance: id.clone(), started_ms: now_ms(), sessions: 0 };
    put_json(kv, &keys::instance(&id), &record).await?;
    Ok(id)
}

fn hostname_id() -> String {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }
    if let Ok(hostname) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_owned();
        }
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("pulse-{}", &suffix[..8])
}

/// Refresh the instance registration TTL and session-count gauge.
fn spawn_instance_heartbeat(store: Arc<Store>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(store.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let record = InstanceRecord {
                        instance: store.instance.clone(),
                        started_ms: now_ms(),
                        sessions: store.registry.len().await as u32,
                    };
                    if let Err(e) = put_json(
                        store.kv.presence.as_ref(),
                        &keys::instance(&store.instance),
                        &record,
                    )
                    .await
                    {
                        warn!(err = %e, "instance heartbeat failed");
                    }
                }
            }
        }
    });
}

/// Close sessions whose heartbeat is overdue, and checkpoint everyone
/// on the periodic cadence.
fn spawn_session_watchdog(store: Arc<Store>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(store.config.checkpoint_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let deadline = store.config.heartbeat_deadline();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for session in store.registry.all_sessions().await {
                        if session.heartbeat_age() > deadline {
                            info!(session = %session.id, user = %session.user, "heartbeat expired");
                            store.request_close(&session, CloseReason::HeartbeatTimeout);
                            continue;
                        }
                        let seq = session.last_delivered_seq.load(Ordering::Acquire);
                        if seq > 0 {
                            if let Err(e) = store.catchup.checkpoint(&session.user, seq).await {
                                tracing::debug!(user = %session.user, "periodic checkpoint failed: {e}");
                            }
                        }
                    }
                }
            }
        }
    });
}

/// Graceful shutdown: stop intake, terminate sessions with the shutdown
/// reason, checkpoint, and release the instance id.
async fn graceful_teardown(store: &Arc<Store>) {
    store.accepting.store(false, Ordering::Release);
    let sessions = store.registry.all_sessions().await;
    info!(count = sessions.len(), "graceful shutdown, terminating sessions");
    for session in &sessions {
        store.request_close(session, CloseReason::Shutdown);
        let seq = session.last_delivered_seq.load(Ordering::Acquire);
        if seq > 0 {
            if let Err(e) = store.catchup.checkpoint(&session.user, seq).await {
                tracing::debug!(user = %session.user, "shutdown checkpoint failed: {e}");
            }
        }
    }
    tokio::time::sleep(store.config.shutdown_drain()).await;
    if let Err(e) = store.kv.presence.delete(&keys::instance(&store.instance)).await {
        warn!(err = %e, "instance id release failed");
    }
}
