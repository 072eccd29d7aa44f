// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus subject construction and parsing.
//!
//! Durable-log subjects (`messages.*`, `channels.member.*`) are produced
//! by the command side and pull-consumed by the fan-out router. Ephemeral
//! subjects (`instance.events.*`, `user.sync.*`, `typing.*`,
//! `presence.changed.*`) carry delivery and coordination traffic.

/// JetStream stream holding the durable event log.
pub const EVENTS_STREAM: &str = "EVENTS";

/// Subjects the fan-out router's durable pull consumer filters on.
pub const LOG_FILTER_SUBJECTS: [&str; 2] = ["messages.>", "channels.member.>"];

/// Wildcard for the router's ephemeral coordination subscriptions.
pub const USER_SYNC_WILDCARD: &str = "user.sync.>";
pub const TYPING_WILDCARD: &str = "typing.>";
pub const PRESENCE_WILDCARD: &str = "presence.changed.>";

/// Per-instance inbox subject: the single delivery subscription an
/// instance holds.
pub fn instance_events(instance: &str) -> String {
    format!("instance.events.{instance}")
}

pub fn user_sync(user: &str) -> String {
    format!("user.sync.{user}")
}

pub fn typing(channel: &str) -> String {
    format!("typing.{channel}")
}

pub fn presence_changed(user: &str) -> String {
    format!("presence.changed.{user}")
}

/// Durable-log subject for a message lifecycle event
/// (`op` ∈ send | edit | delete | react | thread_reply).
pub fn message(op: &str, channel: &str) -> String {
    format!("messages.{op}.{channel}")
}

/// Durable-log subject for a membership change (`op` ∈ join | leave).
pub fn member(op: &str, channel: &str) -> String {
    format!("channels.member.{op}.{channel}")
}

/// Extract the instance id from an `instance.events.{id}` subject.
pub fn parse_instance_events(subject: &str) -> Option<&str> {
    strip_nonempty(subject, "instance.events.")
}

/// Extract the user id from a `user.sync.{user}` subject.
pub fn parse_user_sync(subject: &str) -> Option<&str> {
    strip_nonempty(subject, "user.sync.")
}

/// Extract the channel id from a `typing.{channel}` subject.
pub fn parse_typing(subject: &str) -> Option<&str> {
    strip_nonempty(subject, "typing.")
}

/// Extract the user id from a `presence.changed.{user}` subject.
pub fn parse_presence_changed(subject: &str) -> Option<&str> {
    strip_nonempty(subject, "presence.changed.")
}

fn strip_nonempty<'a>(subject: &'a str, prefix: &str) -> Option<&'a str> {
    match subject.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() && !rest.contains('.') => Some(rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_round_trip() {
        assert_eq!(parse_instance_events(&instance_events("n1")), Some("n1"));
        assert_eq!(parse_user_sync(&user_sync("alice")), Some("alice"));
        assert_eq!(parse_typing(&typing("ch_x")), Some("ch_x"));
        assert_eq!(parse_presence_changed(&presence_changed("bob")), Some("bob"));
    }

    #[test]
    fn parse_rejects_foreign_subjects() {
        assert_eq!(parse_instance_events("instance.events."), None);
        assert_eq!(parse_instance_events("user.sync.alice"), None);
        // A nested token means a different subject shape, not an id.
        assert_eq!(parse_typing("typing.ch.extra"), None);
    }

    #[test]
    fn log_subjects() {
        assert_eq!(message("send", "ch_x"), "messages.send.ch_x");
        assert_eq!(message("thread_reply", "ch_x"), "messages.thread_reply.ch_x");
        assert_eq!(member("join", "ch_y"), "channels.member.join.ch_y");
    }
}
