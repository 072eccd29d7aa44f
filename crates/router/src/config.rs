// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Fan-out router for the pulse delivery core.
#[derive(Debug, Clone, Parser)]
#[command(name = "pulse-router", version, about)]
pub struct Config {
    /// NATS server URL.
    #[arg(long, env = "PULSE_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS auth token.
    #[arg(long, env = "PULSE_NATS_TOKEN")]
    pub nats_token: Option<String>,

    /// Host to bind the health/metrics listener on.
    #[arg(long, env = "PULSE_ROUTER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the health/metrics listener.
    #[arg(long, env = "PULSE_ROUTER_PORT", default_value_t = 9700)]
    pub port: u16,

    /// Log pull batch size.
    #[arg(long, env = "PULSE_FANOUT_BATCH_SIZE", default_value_t = 256)]
    pub fanout_batch_size: usize,

    /// Coalescing window per fan-out worker, in milliseconds.
    #[arg(long, env = "PULSE_FANOUT_BATCH_WINDOW_MS", default_value_t = 1)]
    pub fanout_batch_window_ms: u64,

    /// Fan-out worker shard count.
    #[arg(long, env = "PULSE_FANOUT_WORKER_SHARDS", default_value_t = 8)]
    pub fanout_worker_shards: usize,

    /// Membership cache entry cap.
    #[arg(long, env = "PULSE_MEMBERSHIP_CACHE_CAPACITY", default_value_t = 100_000)]
    pub membership_cache_capacity: usize,

    /// Thread-follower cache inactivity eviction, in seconds.
    #[arg(long, env = "PULSE_THREAD_FOLLOWER_CACHE_TTL_SECONDS", default_value_t = 1800)]
    pub thread_follower_cache_ttl_seconds: u64,

    /// Routing-table integrity check interval, in seconds.
    #[arg(long, env = "PULSE_INTEGRITY_CHECK_SECONDS", default_value_t = 60)]
    pub integrity_check_seconds: u64,

    /// Path to a JSON membership seed file (standalone/dev mode).
    #[arg(long, env = "PULSE_MEMBERSHIP_SEED")]
    pub membership_seed: Option<PathBuf>,

    /// Startup grace: exit non-zero if the bus is unreachable this long.
    #[arg(long, env = "PULSE_STARTUP_GRACE_SECONDS", default_value_t = 30)]
    pub startup_grace_seconds: u64,

    /// Log format (json or text).
    #[arg(long, env = "PULSE_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PULSE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fanout_worker_shards == 0 {
            anyhow::bail!("--fanout-worker-shards must be at least 1");
        }
        if self.fanout_batch_size == 0 {
            anyhow::bail!("--fanout-batch-size must be at least 1");
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.fanout_batch_window_ms)
    }

    pub fn follower_ttl(&self) -> Duration {
        Duration::from_secs(self.thread_follower_cache_ttl_seconds)
    }

    pub fn integrity_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_check_seconds.max(1))
    }
}
