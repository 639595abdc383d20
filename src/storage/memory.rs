//! In-process storage backend.
//!
//! Useful for tests and single-process deployments. State lives in a
//! `tokio::sync::RwLock`, so records vanish on restart and are never
//! shared across processes.

use crate::error::Result;
use crate::records::{StoredRecord, UserId};
use crate::storage::{glob_match, SessionStorage};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

struct Entry {
    payload: String,
    user_id: Option<UserId>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    // BTreeSet keeps scans deterministic.
    user_index: HashMap<UserId, BTreeSet<String>>,
}

impl Inner {
    /// Drop an entry and its index reference.
    fn purge(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            if let Some(user_id) = entry.user_id {
                if let Some(ids) = self.user_index.get_mut(&user_id) {
                    ids.remove(key);
                    if ids.is_empty() {
                        self.user_index.remove(&user_id);
                    }
                }
            }
        }
    }
}

/// Storage backend holding all records in process memory.
pub struct MemorySessionStorage<T> {
    inner: RwLock<Inner>,
    ttl: Option<Duration>,
    _record: PhantomData<fn() -> T>,
}

impl<T: StoredRecord> MemorySessionStorage<T> {
    /// New empty store. `ttl` is applied to every record on create
    /// and refreshed on update; `None` disables expiry.
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            ttl,
            _record: PhantomData,
        }
    }

    fn expiry(&self, now: Instant) -> Option<Instant> {
        self.ttl.map(|ttl| now + ttl)
    }
}

#[async_trait]
impl<T: StoredRecord> SessionStorage<T> for MemorySessionStorage<T> {
    async fn create(&self, record: &T, key: Option<&str>) -> Result<String> {
        let key = key.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let payload = serde_json::to_string(record)?;
        let user_id = record.index_user_id();
        let now = Instant::now();

        let mut inner = self.inner.write().await;
        // Overwrite may change ownership; clear the old index entry.
        inner.purge(&key);
        inner.entries.insert(
            key.clone(),
            Entry {
                payload,
                user_id,
                expires_at: self.expiry(now),
            },
        );
        if let Some(user_id) = user_id {
            inner.user_index.entry(user_id).or_default().insert(key.clone());
        }
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Option<T>> {
        let now = Instant::now();
        {
            let inner = self.inner.read().await;
            match inner.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    return Ok(Some(serde_json::from_str(&entry.payload)?));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: take the write lock to purge lazily.
        self.inner.write().await.purge(key);
        Ok(None)
    }

    async fn update(&self, key: &str, record: &T) -> Result<bool> {
        let payload = serde_json::to_string(record)?;
        let user_id = record.index_user_id();
        let now = Instant::now();

        let mut inner = self.inner.write().await;
        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {}
            Some(_) => {
                inner.purge(key);
                return Ok(false);
            }
            None => return Ok(false),
        }
        inner.purge(key);
        inner.entries.insert(
            key.to_string(),
            Entry {
                payload,
                user_id,
                expires_at: self.expiry(now),
            },
        );
        if let Some(user_id) = user_id {
            inner
                .user_index
                .entry(user_id)
                .or_default()
                .insert(key.to_string());
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let existed = inner
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now));
        inner.purge(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get_user_sessions(&self, user_id: UserId) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let Some(ids) = inner.user_index.get(&user_id) else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = ids.iter().cloned().collect();
        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            if inner.entries.get(&id).is_some_and(|e| !e.is_expired(now)) {
                live.push(id);
            } else {
                inner.purge(&id);
            }
        }
        Ok(live)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            inner.purge(&key);
        }
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let keys = self.scan(pattern).await?;
        let mut inner = self.inner.write().await;
        let count = keys.len() as u64;
        for key in &keys {
            inner.purge(key);
        }
        Ok(count)
    }
}
