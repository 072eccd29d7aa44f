// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pulse_core::bus::nats::NatsBus;
use pulse_core::kv::nats::NatsKv;
use pulse_core::store::MemDirectory;
use pulse_router::config::Config;
use pulse_router::{init_tracing, run, RouterDeps};

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

    let grace = Duration::from_secs(config.startup_grace_seconds.max(1));
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
                error!(err = %e, "pulse-router failed");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!(err = %e, "startup failed");
            std::process::exit(1);
        }
    }
}

async fn build_deps(config: &Config) -> anyhow::Result<RouterDeps> {
    let bus = NatsBus::connect(&config.nats_url, config.nats_token.as_deref()).await?;

    let nats_opts = match &config.nats_token {
        Some(token) => async_nats::ConnectOptions::with_token(token.clone()),
        None => async_nats::ConnectOptions::new(),
    };
    let client = nats_opts.connect(&config.nats_url).await?;
    let js = async_nats::jetstream::new(client);
    let presence_kv =
        NatsKv::open(&js, "pulse-presence", Some(Duration::from_secs(120))).await?;
    let durable_kv = NatsKv::open(&js, "pulse-durable", None).await?;

    // Standalone mode: membership comes from an optional seed file.
    // Production embeds the router as a library and injects the real
    // metadata-store client through `RouterDeps`.
    let directory = MemDirectory::new();
    if let Some(path) = &config.membership_seed {
        let seed = load_seed(path).await?;
        for (channel, users) in seed.channels {
            for user in users {
                directory.join(&user, &channel).await;
            }
        }
        for (thread, users) in seed.threads {
            for user in users {
                directory.follow(&user, &thread).await;
            }
        }
        info!(path = %path.display(), "membership seed loaded");
    }

    Ok(RouterDeps {
        bus: Arc::new(bus),
        presence_kv: Arc::new(presence_kv),
        durable_kv: Arc::new(durable_kv),
        membership: Arc::new(directory),
    })
}

#[derive(Debug, Default, serde::Deserialize)]
struct SeedFile {
    #[serde(default)]
    channels: std::collections::HashMap<String, Vec<String>>,
    #[serde(default)]
    threads: std::collections::HashMap<String, Vec<String>>,
}

async fn load_seed(path: &std::path::Path) -> anyhow::Result<SeedFile> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
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
