// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-device sync payloads carried on `user.sync.{user}`.

use serde::{Deserialize, Serialize};

use crate::envelope::{EventEnvelope, EventKind};

/// A state change one device makes that its sibling devices mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Read pointer advanced for a channel or a followed thread.
    Read {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread: Option<String>,
        event_id: String,
    },
    /// Draft text changed in a channel composer.
    Draft { channel: String, text: String },
    /// Aggregate unread totals changed (drives background-device badges).
    Badge { total: u64, mentions: u64 },
}

impl SyncEvent {
    /// Wrap this sync event in a bus envelope addressed to `user`,
    /// excluding `origin_session` on redelivery.
    pub fn into_envelope(
        self,
        event_id: String,
        user: &str,
        origin_session: &str,
        ts_ms: u64,
    ) -> anyhow::Result<EventEnvelope> {
        Ok(EventEnvelope {
            event_id,
            seq: 0,
            kind: EventKind::UserSync,
            channel_id: None,
            thread_id: None,
            origin_instance: None,
            origin_session: Some(origin_session.to_owned()),
            author: Some(user.to_owned()),
            also_send_to_channel: None,
            ts_ms,
            payload: serde_json::to_value(self)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_event_round_trip() -> anyhow::Result<()> {
        let event = SyncEvent::Read {
            channel: Some("ch_x".into()),
            thread: None,
            event_id: "e77".into(),
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(json["kind"], "read");
        assert!(json.get("thread").is_none());
        let back: SyncEvent = serde_json::from_value(json)?;
        assert_eq!(back, event);
        Ok(())
    }

    #[test]
    fn envelope_wrap_addresses_user() -> anyhow::Result<()> {
        let event = SyncEvent::Draft { channel: "ch".into(), text: "wip".into() };
        let env = event.into_envelope("sy1".into(), "alice", "sess-1", 42)?;
        assert_eq!(env.kind, EventKind::UserSync);
        assert_eq!(env.target_user(), Some("alice"));
        assert_eq!(env.origin_session.as_deref(), Some("sess-1"));
        let back: SyncEvent = serde_json::from_value(env.payload)?;
        assert!(matches!(back, SyncEvent::Draft { .. }));
        Ok(())
    }
}
