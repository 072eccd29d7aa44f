// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared types and capability surfaces for the pulse fan-out core.
//!
//! This crate is the canonical source for the event envelope, the client
//! wire protocol, bus subject and KV key construction, and the driver
//! traits the router and notifier consume: the event bus (durable log +
//! ephemeral pub/sub), the shared KV store, the membership source, and
//! the downstream message store. Each trait ships a NATS-backed driver
//! and an in-memory fake; all tests run against the fakes.

pub mod bus;
pub mod dedup;
pub mod envelope;
pub mod frame;
pub mod keys;
pub mod kv;
pub mod record;
pub mod store;
pub mod subject;
pub mod sync;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
