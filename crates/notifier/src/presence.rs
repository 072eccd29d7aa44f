// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Presence writes for this instance's users.
//!
//! The per-user presence record in KV is the authoritative aggregate
//! across instances; each instance owns its slice of the record and
//! read-modify-writes it on session open/close and device-state change,
//! then broadcasts a sequence-stamped `presence.changed.{user}` for the
//! routing side. Heartbeats re-put the record to refresh its TTL without
//! bumping the sequence, so a crashed instance simply ages out.

use std::sync::Arc;

use tracing::debug;

use pulse_core::bus::Bus;
use pulse_core::frame::{ClientState, PresenceState};
use pulse_core::kv::{get_json, put_json, Kv};
use pulse_core::record::{InstancePresence, PresenceChange, PresenceRecord};
use pulse_core::{keys, now_ms, subject};

use crate::registry::SessionRegistry;

pub struct PresencePublisher {
    instance: String,
    kv: Arc<dyn Kv>,
    bus: Arc<dyn Bus>,
}

impl PresencePublisher {
    pub fn new(instance: String, kv: Arc<dyn Kv>, bus: Arc<dyn Bus>) -> Self {
        Self { instance, kv, bus }
    }

    /// Recompute this instance's slice of `user`'s presence and publish
    /// the change. Called on session open, session close, and
    /// device-state reports.
    pub async fn update(
        &self,
        registry: &SessionRegistry,
        user: &str,
    ) -> anyhow::Result<PresenceChange> {
        let devices = registry.device_states(user).await;
        let device_count = devices.len() as u32;
        let local_state = devices.iter().copied().max().unwrap_or(ClientState::Background);

        let key = keys::presence_user(user);
        let mut record = get_json::<PresenceRecord>(self.kv.as_ref(), &key)
            .await?
            .unwrap_or_else(|| PresenceRecord {
                user: user.to_owned(),
                state: PresenceState::Offline,
                seq: 0,
                device_count: 0,
                last_active_ms: 0,
                instances: Default::default(),
            });

        if device_count == 0 {
            record.instances.remove(&self.instance);
        } else {
            record.instances.insert(
                self.instance.clone(),
                InstancePresence { device_count, state: local_state },
            );
        }
        record.seq += 1;
        record.device_count = record.instances.values().map(|p| p.device_count).sum();
        record.state = PresenceRecord::aggregate(&record.instances);
        record.last_active_ms = now_ms();
        put_json(self.kv.as_ref(), &key, &record).await?;

        let change = PresenceChange {
            user: user.to_owned(),
            instance: self.instance.clone(),
            state: record.state,
            instance_online: device_count > 0,
            seq: record.seq,
            ts_ms: record.last_active_ms,
        };
        let payload = serde_json::to_vec(&change)?;
        self.bus.publish(&subject::presence_changed(user), payload.into()).await?;
        Ok(change)
    }

    /// Heartbeat: refresh the record's TTL without a state change. Falls
    /// back to a full update when the record has already expired.
    pub async fn refresh(
        &self,
        registry: &SessionRegistry,
        user: &str,
    ) -> anyhow::Result<()> {
        let key = keys::presence_user(user);
        match get_json::<PresenceRecord>(self.kv.as_ref(), &key).await? {
            Some(mut record) => {
                record.last_active_ms = now_ms();
                put_json(self.kv.as_ref(), &key, &record).await
            }
            None => {
                debug!(user, "presence record expired under live session, rebuilding");
                self.update(registry, user).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
#[path = "presence_tests.rs"]
mod tests;
