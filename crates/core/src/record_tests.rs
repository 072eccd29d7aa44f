// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeMap;

use super::*;

#[test]
fn unread_bump_and_clear() {
    let mut counters = UnreadCounters::default();
    counters.bump("ch_x", false);
    counters.bump("ch_x", true);
    counters.bump("ch_y", false);
    assert_eq!(counters.channels["ch_x"], 2);
    assert_eq!(counters.total, 3);
    assert_eq!(counters.mentions, 1);

    counters.clear_channel("ch_x");
    assert!(!counters.channels.contains_key("ch_x"));
    assert_eq!(counters.total, 1);
    // Clearing a channel with no entry is a no-op.
    counters.clear_channel("ch_z");
    assert_eq!(counters.total, 1);
}

#[test]
fn active_channel_lru_caps_and_reorders() {
    let mut record = ClientStateRecord::default();
    for ch in ["a", "b", "c"] {
        record.touch_channel(ch, 2);
    }
    assert_eq!(record.active_channels, vec!["c", "b"]);
    record.touch_channel("b", 2);
    assert_eq!(record.active_channels, vec!["b", "c"]);
}

fn inst(device_count: u32, state: ClientState) -> InstancePresence {
    InstancePresence { device_count, state }
}

#[test]
fn presence_lattice_aggregation() {
    let mut instances = BTreeMap::new();
    assert_eq!(PresenceRecord::aggregate(&instances), PresenceState::Offline);

    instances.insert("n1".to_owned(), inst(1, ClientState::Background));
    assert_eq!(PresenceRecord::aggregate(&instances), PresenceState::Away);

    instances.insert("n2".to_owned(), inst(2, ClientState::Idle));
    assert_eq!(PresenceRecord::aggregate(&instances), PresenceState::Idle);

    instances.insert("n3".to_owned(), inst(1, ClientState::Active));
    assert_eq!(PresenceRecord::aggregate(&instances), PresenceState::Online);

    // An instance with zero devices contributes nothing.
    let mut empty_only = BTreeMap::new();
    empty_only.insert("n1".to_owned(), inst(0, ClientState::Active));
    assert_eq!(PresenceRecord::aggregate(&empty_only), PresenceState::Offline);
}

mod properties {
    use proptest::prelude::*;

    use super::*;

    fn state_strategy() -> impl Strategy<Value = ClientState> {
        prop_oneof![
            Just(ClientState::Active),
            Just(ClientState::Idle),
            Just(ClientState::Background),
        ]
    }

    proptest! {
        // The aggregate follows the device-state lattice: any active
        // device makes the user online, and a user with no devices at
        // all is offline.
        #[test]
        fn aggregate_follows_the_lattice(
            devices in proptest::collection::vec((0u32..4, state_strategy()), 0..6),
        ) {
            let mut instances = BTreeMap::new();
            for (i, (count, state)) in devices.iter().enumerate() {
                instances.insert(
                    format!("n{i}"),
                    InstancePresence { device_count: *count, state: *state },
                );
            }
            let aggregate = PresenceRecord::aggregate(&instances);

            let live: Vec<ClientState> = instances
                .values()
                .filter(|p| p.device_count > 0)
                .map(|p| p.state)
                .collect();
            if live.is_empty() {
                prop_assert_eq!(aggregate, PresenceState::Offline);
            } else if live.contains(&ClientState::Active) {
                prop_assert_eq!(aggregate, PresenceState::Online);
            } else if live.contains(&ClientState::Idle) {
                prop_assert_eq!(aggregate, PresenceState::Idle);
            } else {
                prop_assert_eq!(aggregate, PresenceState::Away);
            }
        }
    }
}

#[test]
fn record_round_trips() -> anyhow::Result<()> {
    let pointer = ReadPointer { event_id: "e7".into(), seq: 7, ts_ms: 1 };
    let back: ReadPointer = serde_json::from_str(&serde_json::to_string(&pointer)?)?;
    assert_eq!(back.seq, 7);

    let latest = ChannelLatest { event_id: "e9".into(), seq: 9, ts_ms: 2, sender: None };
    let json = serde_json::to_string(&latest)?;
    assert!(!json.contains("sender"));

    let change = PresenceChange {
        user: "alice".into(),
        instance: "n1".into(),
        state: PresenceState::Online,
        instance_online: true,
        seq: 3,
        ts_ms: 4,
    };
    let back: PresenceChange = serde_json::from_str(&serde_json::to_string(&change)?)?;
    assert!(back.instance_online);
    Ok(())
}
