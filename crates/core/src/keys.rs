// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! KV key construction.
//!
//! Keys are grouped into four stores with distinct TTL policies:
//! presence (short TTL, heartbeat-refreshed), session state (24 h),
//! handshake tokens (30 s, get-and-delete), and durable read state
//! (no TTL).

/// `presence:user:{user}` — aggregated presence record. Presence store.
pub fn presence_user(user: &str) -> String {
    format!("presence:user:{user}")
}

/// `instance:{id}` — instance registration, heartbeat-refreshed. Presence store.
pub fn instance(id: &str) -> String {
    format!("instance:{id}")
}

/// `client-state:user:{user}:session` — reconnect checkpoint record. Session store.
pub fn client_state(user: &str) -> String {
    format!("client-state:user:{user}:session")
}

/// `read-pointer:{user}:{channel}` — last-read event for a channel. Durable store.
pub fn read_pointer(user: &str, channel: &str) -> String {
    format!("read-pointer:{user}:{channel}")
}

/// `read-pointer:{user}:thread:{thread}` — last-read event for a followed
/// thread, tracked separately from the parent channel. Durable store.
pub fn thread_read_pointer(user: &str, thread: &str) -> String {
    format!("read-pointer:{user}:thread:{thread}")
}

/// `channel-latest:{channel}` — newest event id/timestamp/sender. Durable store.
pub fn channel_latest(channel: &str) -> String {
    format!("channel-latest:{channel}")
}

/// `unread:{user}` — per-channel counters plus aggregate totals. Durable store.
pub fn unread(user: &str) -> String {
    format!("unread:{user}")
}

/// `ws_token:{token}` — single-use handshake token. Token store.
pub fn ws_token(token: &str) -> String {
    format!("ws_token:{token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(presence_user("alice"), "presence:user:alice");
        assert_eq!(client_state("alice"), "client-state:user:alice:session");
        assert_eq!(read_pointer("alice", "ch_x"), "read-pointer:alice:ch_x");
        assert_eq!(thread_read_pointer("alice", "t1"), "read-pointer:alice:thread:t1");
        assert_eq!(channel_latest("ch_x"), "channel-latest:ch_x");
        assert_eq!(unread("bob"), "unread:bob");
        assert_eq!(ws_token("abc"), "ws_token:abc");
        assert_eq!(instance("n1"), "instance:n1");
    }
}
