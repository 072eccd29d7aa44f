// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pulse fan-out router: routes channel events from the durable log to
//! the minimum set of notification-server instances.

pub mod config;
pub mod fanout;
pub mod followers;
pub mod membership;
pub mod presence;
pub mod routing;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pulse_core::bus::Bus;
use pulse_core::kv::Kv;
use pulse_core::store::MembershipSource;

use crate::config::Config;
use crate::fanout::{FanOut, FanOutConfig};
use crate::followers::FollowerCache;
use crate::membership::MembershipCache;
use crate::presence::PresenceTracker;
use crate::routing::RoutingTable;

/// External collaborators the router consumes, injected by the caller.
pub struct RouterDeps {
    pub bus: Arc<dyn Bus>,
    pub presence_kv: Arc<dyn Kv>,
    /// Durable KV for per-user unread counters.
    pub durable_kv: Arc<dyn Kv>,
    pub membership: Arc<dyn MembershipSource>,
}

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

/// Run the router until shutdown.
pub async fn run(
    config: Config,
    deps: RouterDeps,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let table = Arc::new(RoutingTable::new());
    let cache =
        Arc::new(MembershipCache::new(Arc::clone(&deps.membership), config.membership_cache_capacity));
    let followers = Arc::new(FollowerCache::new(Arc::clone(&deps.membership), config.follower_ttl()));

    let tracker =
        Arc::new(PresenceTracker::new(Arc::clone(&table), Arc::clone(&cache), Arc::clone(&deps.bus)));
    if let Err(e) = tracker.reconcile(deps.presence_kv.as_ref()).await {
        warn!(err = %e, "presence reconcile failed, routing warms up lazily");
    }
    let tracker_task = Arc::clone(&tracker).spawn(Arc::clone(&deps.presence_kv), shutdown.clone());

    let fanout = Arc::new(FanOut::new(
        Arc::clone(&table),
        Arc::clone(&cache),
        Arc::clone(&followers),
        Arc::clone(&deps.bus),
        Arc::clone(&deps.durable_kv),
        FanOutConfig {
            batch_size: config.fanout_batch_size,
            batch_window: config.batch_window(),
            shards: config.fanout_worker_shards,
            consumer_name: "fanout".to_owned(),
        },
    ));
    let fanout_task = {
        let fanout = Arc::clone(&fanout);
        let sd = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = fanout.run(sd).await {
                tracing::error!(err = %e, "fan-out loop failed");
            }
        })
    };

    spawn_maintenance(
        Arc::clone(&table),
        Arc::clone(&followers),
        config.integrity_interval(),
        shutdown.clone(),
    );

    let router = health_router(Arc::clone(&table))?;
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "pulse-router listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    let _ = tracker_task.await;
    let _ = fanout_task.await;
    Ok(())
}

/// Periodic routing-table integrity check and follower-cache eviction.
fn spawn_maintenance(
    table: Arc<RoutingTable>,
    followers: Arc<FollowerCache>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let divergences = table.verify();
                    if divergences > 0 {
                        warn!(divergences, "routing table integrity check found divergences");
                        metrics::counter!("pulse_routing_invariant_violations_total")
                            .increment(divergences as u64);
                    }
                    let (channels, users) = table.sizes();
                    metrics::gauge!("pulse_routing_channels").set(channels as f64);
                    metrics::gauge!("pulse_routing_users").set(users as f64);

                    let evicted = followers.evict_idle().await;
                    if evicted > 0 {
                        tracing::debug!(evicted, "evicted idle follower sets");
                    }
                }
            }
        }
    });
}

/// Health, readiness, metrics, and the routing-topology debug endpoint.
fn health_router(table: Arc<RoutingTable>) -> anyhow::Result<axum::Router> {
    use axum::routing::get;

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("metrics recorder: {e}"))?;

    let router = axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .route(
            "/debug/routing",
            get(move || {
                let table = Arc::clone(&table);
                async move { axum::Json(table.snapshot()) }
            }),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http());
    Ok(router)
}
