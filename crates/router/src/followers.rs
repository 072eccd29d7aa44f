// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thread-follower cache.
//!
//! Follower sets are small and thread activity is bursty, so entries are
//! fetched lazily and evicted after a configurable idle period (default
//! 30 minutes). A periodic task calls [`FollowerCache::evict_idle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use pulse_core::store::MembershipSource;

struct CacheEntry {
    followers: Arc<HashSet<String>>,
    last_access: Instant,
}

pub struct FollowerCache {
    source: Arc<dyn MembershipSource>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FollowerCache {
    pub fn new(source: Arc<dyn MembershipSource>, ttl: Duration) -> Self {
        Self { source, ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Followers of `thread`; fetched on miss.
    pub async fn followers(&self, thread: &str) -> anyhow::Result<Arc<HashSet<String>>> {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(thread) {
                entry.last_access = Instant::now();
                return Ok(Arc::clone(&entry.followers));
            }
        }

        let followers: Arc<HashSet<String>> =
            Arc::new(self.source.thread_followers(thread).await?.into_iter().collect());
        let mut entries = self.entries.lock().await;
        // A racing fetch may have landed first; last writer wins, both
        // results came from the same source.
        entries.insert(
            thread.to_owned(),
            CacheEntry { followers: Arc::clone(&followers), last_access: Instant::now() },
        );
        Ok(followers)
    }

    /// Drop a thread's cached set (a follow/unfollow landed).
    pub async fn invalidate(&self, thread: &str) {
        self.entries.lock().await.remove(thread);
    }

    /// Evict entries idle longer than the TTL. Returns the eviction count.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_access) < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::store::MemDirectory;

    #[tokio::test]
    async fn fetch_and_cache() -> anyhow::Result<()> {
        let dir = Arc::new(MemDirectory::new());
        dir.follow("alice", "t1").await;
        dir.follow("carol", "t1").await;
        let cache = FollowerCache::new(dir, Duration::from_secs(1800));

        let followers = cache.followers("t1").await?;
        assert_eq!(followers.len(), 2);
        assert!(followers.contains("alice"));
        assert_eq!(cache.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_refetches() -> anyhow::Result<()> {
        let dir = Arc::new(MemDirectory::new());
        dir.follow("alice", "t1").await;
        let cache = FollowerCache::new(Arc::clone(&dir) as Arc<dyn MembershipSource>, Duration::from_secs(1800));

        assert_eq!(cache.followers("t1").await?.len(), 1);
        dir.follow("carol", "t1").await;
        cache.invalidate("t1").await;
        assert_eq!(cache.followers("t1").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn idle_entries_age_out() -> anyhow::Result<()> {
        let dir = Arc::new(MemDirectory::new());
        dir.follow("alice", "t1").await;
        let cache = FollowerCache::new(dir, Duration::from_millis(10));

        let _ = cache.followers("t1").await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.evict_idle().await, 1);
        assert!(cache.is_empty().await);
        Ok(())
    }
}
