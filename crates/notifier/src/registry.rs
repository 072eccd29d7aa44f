// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session registry — the per-instance index of open sessions.
//!
//! Three views: session id → session, user → sessions, and
//! channel → local users that should receive channel events. The channel
//! view is seeded from membership at handshake and kept current by
//! membership events relayed through the inbox. Sessions are owned here;
//! everything else refers to them by id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use pulse_core::frame::ClientState;

use crate::session::Session;

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<Session>>,
    users: HashMap<String, HashSet<String>>,
    user_channels: HashMap<String, HashSet<String>>,
    channels: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session and index its user's channels.
    pub async fn register(&self, session: Arc<Session>, channels: Vec<String>) {
        let mut state = self.state.write().await;
        let user = session.user.clone();
        state.users.entry(user.clone()).or_default().insert(session.id.clone());
        for channel in &channels {
            state.channels.entry(channel.clone()).or_default().insert(user.clone());
        }
        state.user_channels.entry(user).or_default().extend(channels);
        state.sessions.insert(session.id.clone(), session);
    }

    /// Remove a session. When it was the user's last local session, the
    /// user leaves every channel index. Returns the removed session.
    pub async fn deregister(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut state = self.state.write().await;
        let session = state.sessions.remove(session_id)?;
        let user = session.user.clone();

        let user_gone = match state.users.get_mut(&user) {
            Some(ids) => {
                ids.remove(session_id);
                ids.is_empty()
            }
            None => true,
        };
        if user_gone {
            state.users.remove(&user);
            if let Some(channels) = state.user_channels.remove(&user) {
                for channel in channels {
                    if let Some(users) = state.channels.get_mut(&channel) {
                        users.remove(&user);
                        if users.is_empty() {
                            state.channels.remove(&channel);
                        }
                    }
                }
            }
        }
        Some(session)
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.state.read().await.sessions.get(session_id).cloned()
    }

    pub async fn sessions_for_user(&self, user: &str) -> Vec<Arc<Session>> {
        let state = self.state.read().await;
        state
            .users
            .get(user)
            .map(|ids| ids.iter().filter_map(|id| state.sessions.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Local users that should receive events for `channel`.
    pub async fn users_in_channel(&self, channel: &str) -> Vec<String> {
        let state = self.state.read().await;
        state.channels.get(channel).map(|users| users.iter().cloned().collect()).unwrap_or_default()
    }

    pub async fn channels_of_user(&self, user: &str) -> HashSet<String> {
        let state = self.state.read().await;
        state.user_channels.get(user).cloned().unwrap_or_default()
    }

    pub async fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.state.read().await.sessions.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.sessions.is_empty()
    }

    /// Membership change for an online user: start routing `channel`
    /// locally. No-op when the user has no local sessions.
    pub async fn apply_join(&self, user: &str, channel: &str) {
        let mut state = self.state.write().await;
        if !state.users.contains_key(user) {
            return;
        }
        state.channels.entry(channel.to_owned()).or_default().insert(user.to_owned());
        state.user_channels.entry(user.to_owned()).or_default().insert(channel.to_owned());
    }

    pub async fn apply_leave(&self, user: &str, channel: &str) {
        let mut state = self.state.write().await;
        if let Some(users) = state.channels.get_mut(channel) {
            users.remove(user);
            if users.is_empty() {
                state.channels.remove(channel);
            }
        }
        if let Some(channels) = state.user_channels.get_mut(user) {
            channels.remove(channel);
        }
    }

    /// Per-device states for a user's local sessions, for presence
    /// aggregation.
    pub async fn device_states(&self, user: &str) -> Vec<ClientState> {
        let state = self.state.read().await;
        state
            .users
            .get(user)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.sessions.get(id))
                    .map(|s| *s.state.read())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
