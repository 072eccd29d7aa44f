// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use clap::Parser;

/// Notification server for the pulse delivery core.
#[derive(Debug, Clone, Parser)]
#[command(name = "pulse-notifier", version, about)]
pub struct Config {
    /// NATS server URL.
    #[arg(long, env = "PULSE_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS auth token.
    #[arg(long, env = "PULSE_NATS_TOKEN")]
    pub nats_token: Option<String>,

    /// Host to bind the client listener on.
    #[arg(long, env = "PULSE_NOTIFIER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the client listener (WebSocket + health).
    #[arg(long, env = "PULSE_NOTIFIER_PORT", default_value_t = 9600)]
    pub port: u16,

    /// How the instance id is chosen (auto-from-hostname, env, explicit).
    #[arg(long, env = "PULSE_INSTANCE_ID_STRATEGY", default_value = "auto")]
    pub instance_id_strategy: String,

    /// Instance id when the strategy is `explicit`.
    #[arg(long, env = "PULSE_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Session cap; new connections are refused beyond it.
    #[arg(long, env = "PULSE_MAX_SESSIONS", default_value_t = 50_000)]
    pub max_sessions_per_instance: usize,

    /// Expected client heartbeat interval, in seconds.
    #[arg(long, env = "PULSE_HEARTBEAT_INTERVAL_SECONDS", default_value_t = 30)]
    pub heartbeat_interval_seconds: u64,

    /// A session missing this many heartbeat intervals is closed.
    #[arg(long, env = "PULSE_HEARTBEAT_MISS_MULTIPLIER", default_value_t = 2)]
    pub heartbeat_miss_multiplier: u32,

    /// Per-session outbound queue depth.
    #[arg(long, env = "PULSE_SESSION_OUTBOUND_QUEUE_SIZE", default_value_t = 256)]
    pub session_outbound_queue_size: usize,

    /// Largest reconnect gap served from log replay (tier 1), seconds.
    #[arg(long, env = "PULSE_T1_MAX_GAP_SECONDS", default_value_t = 120)]
    pub t1_max_gap_seconds: u64,

    /// Largest gap served from the message store (tier 2), seconds.
    #[arg(long, env = "PULSE_T2_MAX_GAP_SECONDS", default_value_t = 3600)]
    pub t2_max_gap_seconds: u64,

    /// Largest gap served as an unread summary (tier 3), seconds.
    #[arg(long, env = "PULSE_T3_MAX_GAP_SECONDS", default_value_t = 86_400)]
    pub t3_max_gap_seconds: u64,

    /// Active-channel set cap per user for tier-2 scans.
    #[arg(long, env = "PULSE_ACTIVE_CHANNELS_PER_USER_CAP", default_value_t = 50)]
    pub active_channels_per_user_cap: usize,

    /// Concurrent tier-2 store scans per reconnecting session.
    #[arg(long, env = "PULSE_T2_SCAN_CONCURRENCY", default_value_t = 50)]
    pub t2_scan_concurrency: usize,

    /// Overall catchup deadline per session, seconds.
    #[arg(long, env = "PULSE_CATCHUP_DEADLINE_SECONDS", default_value_t = 30)]
    pub catchup_deadline_seconds: u64,

    /// Checkpoint the delivery position every N delivered events.
    #[arg(long, env = "PULSE_CHECKPOINT_EVENTS", default_value_t = 100)]
    pub checkpoint_events: u64,

    /// Checkpoint the delivery position at least every N seconds.
    #[arg(long, env = "PULSE_CHECKPOINT_SECONDS", default_value_t = 5)]
    pub checkpoint_seconds: u64,

    /// Inbox backlog above which new sessions are refused.
    #[arg(long, env = "PULSE_INBOX_LAG_THRESHOLD", default_value_t = 512)]
    pub inbox_lag_threshold: usize,

    /// Grace period for draining on shutdown, seconds.
    #[arg(long, env = "PULSE_SHUTDOWN_DRAIN_SECONDS", default_value_t = 5)]
    pub shutdown_drain_seconds: u64,

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
        match self.instance_id_strategy.as_str() {
            "auto" => {}
            "env" | "explicit" => {
                if self.instance_id.is_none() {
                    anyhow::bail!(
                        "an instance id is required with --instance-id-strategy {}",
                        self.instance_id_strategy
                    );
                }
            }
            other => anyhow::bail!("unknown instance-id strategy: {other}"),
        }
        if self.heartbeat_interval_seconds == 0 {
            anyhow::bail!("--heartbeat-interval-seconds must be at least 1");
        }
        if self.heartbeat_miss_multiplier == 0 {
            anyhow::bail!("--heartbeat-miss-multiplier must be at least 1");
        }
        if !(self.t1_max_gap_seconds < self.t2_max_gap_seconds
            && self.t2_max_gap_seconds < self.t3_max_gap_seconds)
        {
            anyhow::bail!("tier gap bounds must be strictly increasing");
        }
        if self.session_outbound_queue_size == 0 {
            anyhow::bail!("--session-outbound-queue-size must be at least 1");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    /// A session with no heartbeat for this long is closed.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_miss_multiplier
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_seconds.max(1))
    }

    pub fn catchup_deadline(&self) -> Duration {
        Duration::from_secs(self.catchup_deadline_seconds.max(1))
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() -> anyhow::Result<()> {
        let config = Config::parse_from(["pulse-notifier"]);
        config.validate()?;
        assert_eq!(config.heartbeat_deadline(), Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn explicit_strategy_requires_id() {
        let config =
            Config::parse_from(["pulse-notifier", "--instance-id-strategy", "explicit"]);
        assert!(config.validate().is_err());

        let config = Config::parse_from([
            "pulse-notifier",
            "--instance-id-strategy",
            "explicit",
            "--instance-id",
            "n1",
        ]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tier_bounds_must_increase() {
        let config = Config::parse_from([
            "pulse-notifier",
            "--t1-max-gap-seconds",
            "3600",
            "--t2-max-gap-seconds",
            "120",
        ]);
        assert!(config.validate().is_err());
    }
}
