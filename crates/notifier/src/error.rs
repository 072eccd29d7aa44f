// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reasons a server closes a session. The wire string rides in
/// `session.terminated` so clients can distinguish retryable closes
/// from protocol faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Graceful instance shutdown; reconnect elsewhere.
    Shutdown,
    /// Malformed frame, unknown type, or oversized frame.
    Protocol,
    /// Handshake failed: invalid or already-consumed token.
    Auth,
    /// Heartbeat missed beyond the allowed window.
    HeartbeatTimeout,
    /// Outbound queue overflowed with undroppable frames.
    QueueOverflow,
    /// Instance at session capacity or shedding load.
    Capacity,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Protocol => "protocol",
            Self::Auth => "auth",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::QueueOverflow => "queue_overflow",
            Self::Capacity => "capacity",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
