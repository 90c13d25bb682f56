//! In-process coordination store
//!
//! Values live in a `DashMap` with `tokio::time` expiry; compare-and-swap
//! runs under the entry's shard lock, so it is atomic with respect to every
//! other operation. Pub/sub uses one `broadcast` channel per channel name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::warn;

use super::{CoordinationStore, Subscription};
use crate::{Error, Result};

/// Buffered messages per channel before slow subscribers lag
const CHANNEL_CAPACITY: usize = 256;

struct Stored {
    value: String,
    expires_at: Instant,
}

impl Stored {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Coordination store held in process memory
pub struct MemoryStore {
    entries: DashMap<String, Stored>,
    channels: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every operation fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CoordinationStoreUnavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }

    /// Drop expired keys and channels nobody listens on; returns keys removed
    pub fn purge(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live());
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before.saturating_sub(self.entries.len())
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().is_live()).count()
    }

    /// Whether no live key exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .entries
            .get(key)
            .filter(|stored| stored.is_live())
            .map(|stored| stored.value.clone()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live() {
                    Ok(false)
                } else {
                    entry.insert(Stored::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Stored::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries.insert(key.to_string(), Stored::new(value, ttl));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        match self.entries.get_mut(key) {
            Some(mut stored) if stored.is_live() => {
                stored.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| stored.is_live()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.check()?;
        match self.entries.get_mut(key) {
            Some(mut stored) if stored.is_live() && stored.value == expected => {
                *stored = Stored::new(new, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .entries
            .remove_if(key, |_, stored| stored.is_live() && stored.value == expected)
            .is_some())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.check()?;
        let Some(tx) = self.channels.get(channel).map(|tx| tx.value().clone()) else {
            return Ok(0);
        };
        match tx.send(message.to_string()) {
            Ok(reached) => Ok(reached),
            Err(_) => {
                self.channels
                    .remove_if(channel, |_, tx| tx.receiver_count() == 0);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.check()?;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let channel = channel.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("k", "a", TTL).await.unwrap());
        assert!(!store.set_nx_ex("k", "b", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_refresh() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.expire("k", TTL).await.unwrap());
        // Expired keys can be claimed again
        assert!(store.set_nx_ex("k", "w", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        assert!(!store.compare_and_swap("k", "a", "b", TTL).await.unwrap());

        store.set_ex("k", "a", TTL).await.unwrap();
        assert!(!store.compare_and_swap("k", "x", "b", TTL).await.unwrap());
        assert!(store.compare_and_swap("k", "a", "b", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cas_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        store.set_ex("k", "dead", TTL).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .compare_and_swap("k", "dead", &format!("w{i}"), TTL)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let store = MemoryStore::new();
        store.set_ex("k", "mine", TTL).await.unwrap();
        assert!(!store.delete_if_equals("k", "theirs").await.unwrap());
        assert!(store.delete_if_equals("k", "mine").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", "lost").await.unwrap(), 0);

        let mut sub = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", "hello").await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(Error::CoordinationStoreUnavailable(_))
        ));
        assert!(store.set_nx_ex("k", "v", TTL).await.is_err());
        store.set_available(true);
        assert!(store.set_nx_ex("k", "v", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_expired() {
        let store = MemoryStore::new();
        store.set_ex("short", "v", Duration::from_secs(1)).await.unwrap();
        store.set_ex("long", "v", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge(), 1);
        assert_eq!(store.len(), 1);
    }
}
