// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lazy membership cache over the metadata store.
//!
//! Both directions are cached: user → channels (presence handling) and
//! channel → members (fan-out fallback and non-channel events). Misses
//! are single-flight — concurrent callers for the same key wait on the
//! one in-flight fetch. Entries are LRU-bounded, except that users with
//! live presence are pinned for the duration of their sessions.
//! Membership events invalidate; the next access re-fetches in full.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use pulse_core::store::MembershipSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    User,
    Channel,
}

enum Slot {
    Ready(Arc<HashSet<String>>),
    Pending(watch::Receiver<bool>),
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<(Side, String), Slot>,
    lru: VecDeque<(Side, String)>,
    pinned_users: HashSet<String>,
}

impl CacheState {
    fn touch(&mut self, key: &(Side, String)) {
        self.lru.retain(|k| k != key);
        self.lru.push_back(key.clone());
    }

    fn evict_down_to(&mut self, capacity: usize) {
        while self.slots.len() > capacity {
            let Some(victim) = self.victim() else {
                return;
            };
            self.slots.remove(&victim);
            self.lru.retain(|k| k != &victim);
        }
    }

    fn victim(&self) -> Option<(Side, String)> {
        self.lru
            .iter()
            .find(|(side, key)| {
                !(matches!(side, Side::User) && self.pinned_users.contains(key))
                    && matches!(self.slots.get(&(*side, key.clone())), Some(Slot::Ready(_)))
            })
            .cloned()
    }
}

pub struct MembershipCache {
    source: Arc<dyn MembershipSource>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl MembershipCache {
    pub fn new(source: Arc<dyn MembershipSource>, capacity: usize) -> Self {
        Self { source, capacity: capacity.max(1), state: Mutex::new(CacheState::default()) }
    }

    /// Current membership for `user`; blocking fetch on miss.
    pub async fn channels_for_user(&self, user: &str) -> anyhow::Result<Arc<HashSet<String>>> {
        self.get(Side::User, user).await
    }

    /// Current members of `channel`; blocking fetch on miss.
    pub async fn members_of_channel(
        &self,
        channel: &str,
    ) -> anyhow::Result<Arc<HashSet<String>>> {
        self.get(Side::Channel, channel).await
    }

    /// Pin `user` so their entry survives eviction while online.
    pub async fn pin_user(&self, user: &str) {
        self.state.lock().await.pinned_users.insert(user.to_owned());
    }

    pub async fn unpin_user(&self, user: &str) {
        self.state.lock().await.pinned_users.remove(user);
    }

    /// Drop cached state touched by a membership change. The next access
    /// re-fetches from the source.
    pub async fn invalidate(&self, user: &str, channel: &str) {
        let mut state = self.state.lock().await;
        for key in [(Side::User, user.to_owned()), (Side::Channel, channel.to_owned())] {
            // Pending fetches are left to finish; their result may be
            // stale for one access, which re-invalidation covers.
            if matches!(state.slots.get(&key), Some(Slot::Ready(_))) {
                state.slots.remove(&key);
                state.lru.retain(|k| k != &key);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.slots.is_empty()
    }

    async fn get(&self, side: Side, id: &str) -> anyhow::Result<Arc<HashSet<String>>> {
        let key = (side, id.to_owned());
        loop {
            let mut waiter = {
                let mut state = self.state.lock().await;
                match state.slots.get(&key) {
                    Some(Slot::Ready(set)) => {
                        let set = Arc::clone(set);
                        state.touch(&key);
                        return Ok(set);
                    }
                    Some(Slot::Pending(rx)) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        state.slots.insert(key.clone(), Slot::Pending(rx));
                        drop(state);
                        return self.fetch(side, id, key, tx).await;
                    }
                }
            };
            // The fetcher flips the watch once the slot is resolved.
            if waiter.changed().await.is_err() {
                // Fetcher dropped without resolving; retry from scratch.
                let mut state = self.state.lock().await;
                if matches!(state.slots.get(&key), Some(Slot::Pending(_))) {
                    state.slots.remove(&key);
                }
            }
        }
    }

    async fn fetch(
        &self,
        side: Side,
        id: &str,
        key: (Side, String),
        done: watch::Sender<bool>,
    ) -> anyhow::Result<Arc<HashSet<String>>> {
        let result = match side {
            Side::User => self.source.channels_for_user(id).await,
            Side::Channel => self.source.members_of_channel(id).await,
        };
        let mut state = self.state.lock().await;
        match result {
            Ok(values) => {
                let set = Arc::new(values.into_iter().collect::<HashSet<String>>());
                state.slots.insert(key.clone(), Slot::Ready(Arc::clone(&set)));
                state.touch(&key);
                state.evict_down_to(self.capacity);
                drop(state);
                let _ = done.send(true);
                Ok(set)
            }
            Err(e) => {
                state.slots.remove(&key);
                drop(state);
                let _ = done.send(true);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[path = "membership_tests.rs"]
mod tests;
