// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory routing table: channel → {instance → user-set} and
//! user → {instance → channel-set}.
//!
//! Reads outnumber writes by orders of magnitude, and a single presence
//! change for a heavy user can touch 100K channel entries, so locking is
//! per shard rather than global: lookups on unrelated channels proceed
//! while a mutation walks its own shards. A channel entry holds user ids
//! only — never session references — so routing owns nothing with a
//! lifecycle of its own.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use serde::Serialize;

const SHARD_COUNT: usize = 64;

/// Per-channel routing entry: which instances need this channel, and for
/// which local users.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ChannelEntry {
    pub instances: HashMap<String, HashSet<String>>,
}

/// Per-user routing entry: where the user is connected and which
/// channels that presence routes.
#[derive(Debug, Default, Clone, Serialize)]
pub struct UserEntry {
    pub instances: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
struct ChannelShard {
    channels: HashMap<String, ChannelEntry>,
}

#[derive(Default)]
struct UserShard {
    users: HashMap<String, UserEntry>,
}

/// Snapshot of the full table, for debugging and recovery only.
#[derive(Debug, Default, Serialize)]
pub struct TopologySnapshot {
    pub channels: HashMap<String, ChannelEntry>,
    pub users: HashMap<String, UserEntry>,
}

pub struct RoutingTable {
    channel_shards: Vec<RwLock<ChannelShard>>,
    user_shards: Vec<RwLock<UserShard>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_of(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize % SHARD_COUNT
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            channel_shards: (0..SHARD_COUNT).map(|_| RwLock::new(ChannelShard::default())).collect(),
            user_shards: (0..SHARD_COUNT).map(|_| RwLock::new(UserShard::default())).collect(),
        }
    }

    /// Instances that currently need events for `channel`. A snapshot:
    /// it may trail a concurrent mutation by one update.
    pub fn lookup(&self, channel: &str) -> Vec<String> {
        let shard = self.channel_shards[shard_of(channel)].read();
        shard
            .channels
            .get(channel)
            .map(|entry| entry.instances.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Instances holding sessions for `user`.
    pub fn user_instances(&self, user: &str) -> Vec<String> {
        let shard = self.user_shards[shard_of(user)].read();
        shard
            .users
            .get(user)
            .map(|entry| entry.instances.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels routed for `user` across all of their instances.
    pub fn user_channels(&self, user: &str) -> HashSet<String> {
        let shard = self.user_shards[shard_of(user)].read();
        shard
            .users
            .get(user)
            .map(|entry| entry.instances.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `user`'s presence on `instance` across `channels`.
    /// Idempotent: re-applying yields the same state.
    pub fn add_presence(&self, user: &str, instance: &str, channels: &[String]) {
        {
            let mut shard = self.user_shards[shard_of(user)].write();
            let entry = shard.users.entry(user.to_owned()).or_default();
            let set = entry.instances.entry(instance.to_owned()).or_default();
            set.extend(channels.iter().cloned());
        }
        // One write acquisition per touched shard, not per channel.
        for (idx, group) in group_by_shard(channels) {
            let mut shard = self.channel_shards[idx].write();
            for channel in group {
                shard
                    .channels
                    .entry(channel.clone())
                    .or_default()
                    .instances
                    .entry(instance.to_owned())
                    .or_default()
                    .insert(user.to_owned());
            }
        }
    }

    /// Remove `user` from every channel entry and drop the user entry.
    pub fn remove_presence(&self, user: &str) {
        let entry = {
            let mut shard = self.user_shards[shard_of(user)].write();
            shard.users.remove(user)
        };
        let Some(entry) = entry else {
            return;
        };
        for (instance, channels) in entry.instances {
            self.unroute(user, &instance, channels.iter());
        }
    }

    /// Remove `user`'s presence on one instance only, keeping any others.
    pub fn remove_presence_at(&self, user: &str, instance: &str) {
        let channels = {
            let mut shard = self.user_shards[shard_of(user)].write();
            let Some(entry) = shard.users.get_mut(user) else {
                return;
            };
            let channels = entry.instances.remove(instance);
            if entry.instances.is_empty() {
                shard.users.remove(user);
            }
            channels
        };
        if let Some(channels) = channels {
            self.unroute(user, instance, channels.iter());
        }
    }

    /// Membership grew while the user is online: route the new channel
    /// through every instance the user is on. No-op when offline.
    pub fn add_membership(&self, user: &str, channel: &str) {
        let instances = {
            let mut shard = self.user_shards[shard_of(user)].write();
            let Some(entry) = shard.users.get_mut(user) else {
                return;
            };
            let mut touched = Vec::new();
            for (instance, channels) in entry.instances.iter_mut() {
                channels.insert(channel.to_owned());
                touched.push(instance.clone());
            }
            touched
        };
        if instances.is_empty() {
            return;
        }
        let mut shard = self.channel_shards[shard_of(channel)].write();
        let entry = shard.channels.entry(channel.to_owned()).or_default();
        for instance in instances {
            entry.instances.entry(instance).or_default().insert(user.to_owned());
        }
    }

    /// Membership shrank: stop routing `channel` for `user` everywhere.
    pub fn remove_membership(&self, user: &str, channel: &str) {
        let instances = {
            let mut shard = self.user_shards[shard_of(user)].write();
            let Some(entry) = shard.users.get_mut(user) else {
                return;
            };
            let mut touched = Vec::new();
            for (instance, channels) in entry.instances.iter_mut() {
                if channels.remove(channel) {
                    touched.push(instance.clone());
                }
            }
            touched
        };
        for instance in instances {
            self.unroute(user, &instance, std::iter::once(&channel.to_owned()));
        }
    }

    /// Full copy of both indexes. Recovery, debugging, metrics only.
    pub fn snapshot(&self) -> TopologySnapshot {
        let mut snapshot = TopologySnapshot::default();
        for shard in &self.channel_shards {
            let shard = shard.read();
            for (channel, entry) in &shard.channels {
                snapshot.channels.insert(channel.clone(), entry.clone());
            }
        }
        for shard in &self.user_shards {
            let shard = shard.read();
            for (user, entry) in &shard.users {
                snapshot.users.insert(user.clone(), entry.clone());
            }
        }
        snapshot
    }

    /// (channel entries, user entries) counts, for gauges.
    pub fn sizes(&self) -> (usize, usize) {
        let channels = self.channel_shards.iter().map(|s| s.read().channels.len()).sum();
        let users = self.user_shards.iter().map(|s| s.read().users.len()).sum();
        (channels, users)
    }

    /// Count entries violating the cleanup invariant: empty user sets
    /// under an instance, or channel entries with no instances. The
    /// mutators never leave these behind, so any hit is a divergence.
    pub fn verify(&self) -> usize {
        let mut divergences = 0;
        for shard in &self.channel_shards {
            let shard = shard.read();
            for entry in shard.channels.values() {
                if entry.instances.is_empty() {
                    divergences += 1;
                }
                divergences += entry.instances.values().filter(|users| users.is_empty()).count();
            }
        }
        divergences
    }

    fn unroute<'a>(
        &self,
        user: &str,
        instance: &str,
        channels: impl Iterator<Item = &'a String>,
    ) {
        let channels: Vec<String> = channels.cloned().collect();
        for (idx, group) in group_by_shard(&channels) {
            let mut shard = self.channel_shards[idx].write();
            for channel in group {
                let Some(entry) = shard.channels.get_mut(channel) else {
                    continue;
                };
                if let Some(users) = entry.instances.get_mut(instance) {
                    users.remove(user);
                    if users.is_empty() {
                        entry.instances.remove(instance);
                    }
                }
                if entry.instances.is_empty() {
                    shard.channels.remove(channel);
                }
            }
        }
    }
}

/// Group channels by their shard index so each shard lock is taken once.
fn group_by_shard(channels: &[String]) -> HashMap<usize, Vec<&String>> {
    let mut groups: HashMap<usize, Vec<&String>> = HashMap::new();
    for channel in channels {
        groups.entry(shard_of(channel)).or_default().push(channel);
    }
    groups
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
