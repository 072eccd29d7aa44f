// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pulse_core::bus::nats::NatsBus;
use pulse_core::kv::nats::NatsKv;
use pulse_core::kv::KvSet;
use pulse_core::store::{MemDirectory, MemMessageStore};
use pulse_notifier::config::Config;
use pulse_notifier::state::NotifierDeps;
use pulse_notifier::{init_tracing, run};

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_tracing(&config.log_format, &config.log_level);

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let grace = std::time::Duration::from_secs(config.startup_grace_seconds.max(1));
    let deps = match tokio::time::timeout(grace, build_deps(&config)).await {
        Ok(deps) => deps,
        Err(_) => {
            error!("bus unreachable past the startup grace period");
            std::process::exit(1);
        }
    };
    match deps {
        Ok(deps) => {
            if let Err(e) = run(config, deps, shutdown).await {
                error!(err = %e, "pulse-notifier failed");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!(err = %e, "startup failed");
            std::process::exit(1);
        }
    }
}

async fn build_deps(config: &Config) -> anyhow::Result<NotifierDeps> {
    let bus = NatsBus::connect(&config.nats_url, config.nats_token.as_deref()).await?;

    let nats_opts = match &config.nats_token {
        Some(token) => async_nats::ConnectOptions::with_token(token.clone()),
        None => async_nats::ConnectOptions::new(),
    };
    let client = nats_opts.connect(&config.nats_url).await?;
    let js = async_nats::jetstream::new(client);

    let kv = KvSet {
        presence: Arc::new(
            NatsKv::open(&js, "pulse-presence", Some(Duration::from_secs(120))).await?,
        ),
        sessions: Arc::new(
            NatsKv::open(&js, "pulse-sessions", Some(Duration::from_secs(24 * 3600))).await?,
        ),
        tokens: Arc::new(
            NatsKv::open(&js, "pulse-tokens", Some(Duration::from_secs(30))).await?,
        ),
        durable: Arc::new(NatsKv::open(&js, "pulse-durable", None).await?),
    };

    // Standalone mode runs without the metadata and history
    // collaborators; production embeds the notifier as a library and
    // injects real clients through `NotifierDeps`.
    info!("standalone mode: empty membership directory and message store");
    Ok(NotifierDeps {
        bus: Arc::new(bus),
        kv,
        membership: Arc::new(MemDirectory::new()),
        messages: Arc::new(MemMessageStore::new()),
    })
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();
    });
}
