//! Redis storage backend.
//!
//! Records are stored as JSON strings under `{prefix}{id}` with a
//! server-side TTL. User-scoped records are additionally tracked in a
//! Redis set at `{prefix}user_sessions:{user_id}` so "all sessions of
//! user X" is a single `SMEMBERS`, not a key scan.
//!
//! The index set carries its own TTL, one hour past the record TTL,
//! so abandoned sets do not accumulate. Index entries can still
//! outlive their records between expiry and the next index read;
//! `get_user_sessions` prunes those dead references as it goes.

use crate::error::Result;
use crate::records::{StoredRecord, UserId};
use crate::storage::SessionStorage;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

/// Extra lifetime granted to the user index set beyond the record TTL.
const INDEX_TTL_SLACK_SECS: u64 = 3600;

/// Batch size for pipelined deletes in `delete_pattern`.
const DELETE_BATCH: usize = 500;

/// Redis-backed storage with TTL-based expiration.
///
/// `ConnectionManager` multiplexes one reconnecting connection; the
/// store is `Clone` and cheap to share.
pub struct RedisSessionStorage<T> {
    conn_manager: ConnectionManager,
    prefix: String,
    ttl: Option<Duration>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for RedisSessionStorage<T> {
    fn clone(&self) -> Self {
        Self {
            conn_manager: self.conn_manager.clone(),
            prefix: self.prefix.clone(),
            ttl: self.ttl,
            _record: PhantomData,
        }
    }
}

impl<T: StoredRecord> RedisSessionStorage<T> {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the initial
    /// connection fails.
    pub async fn new(url: &str, prefix: impl Into<String>, ttl: Option<Duration>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        Ok(Self {
            conn_manager,
            prefix: prefix.into(),
            ttl,
            _record: PhantomData,
        })
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}{id}", self.prefix)
    }

    fn index_key(&self, user_id: UserId) -> String {
        format!("{}user_sessions:{user_id}", self.prefix)
    }

    fn ttl_secs(&self) -> Option<u64> {
        self.ttl.map(|ttl| ttl.as_secs().max(1))
    }
}

#[async_trait]
impl<T: StoredRecord> SessionStorage<T> for RedisSessionStorage<T> {
    async fn create(&self, record: &T, key: Option<&str>) -> Result<String> {
        let id = key.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let record_key = self.record_key(&id);
        let payload = serde_json::to_string(record)?;

        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        match self.ttl_secs() {
            Some(secs) => {
                pipe.set_ex(&record_key, &payload, secs);
            }
            None => {
                pipe.set(&record_key, &payload);
            }
        }
        // Record and index entry land together or not at all.
        if let Some(user_id) = record.index_user_id() {
            let index_key = self.index_key(user_id);
            pipe.sadd(&index_key, &id).ignore();
            if let Some(secs) = self.ttl_secs() {
                let index_ttl = i64::try_from(secs + INDEX_TTL_SLACK_SECS).unwrap_or(i64::MAX);
                pipe.expire(&index_key, index_ttl).ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!(key = %record_key, "created record in redis");
        Ok(id)
    }

    async fn get(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn_manager.clone();
        let payload: Option<String> = conn.get(self.record_key(key)).await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, key: &str, record: &T) -> Result<bool> {
        let record_key = self.record_key(key);
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn_manager.clone();

        // SET XX refuses to resurrect a missing or expired key, and
        // EX refreshes the TTL in the same command.
        let mut cmd = redis::cmd("SET");
        cmd.arg(&record_key).arg(&payload).arg("XX");
        if let Some(secs) = self.ttl_secs() {
            cmd.arg("EX").arg(secs);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let record_key = self.record_key(key);
        let mut conn = self.conn_manager.clone();

        // Fetch first so the index reference goes with the record.
        let user_id = self.get(key).await?.and_then(|r| r.index_user_id());

        let deleted: u64 = match user_id {
            Some(user_id) => {
                let (deleted, _srem): (u64, u64) = redis::pipe()
                    .atomic()
                    .del(&record_key)
                    .srem(self.index_key(user_id), key)
                    .query_async(&mut conn)
                    .await?;
                deleted
            }
            None => conn.del(&record_key).await?,
        };
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        Ok(conn.exists(self.record_key(key)).await?)
    }

    async fn get_user_sessions(&self, user_id: UserId) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let index_key = self.index_key(user_id);
        let ids: Vec<String> = conn.smembers(&index_key).await?;

        let mut live = Vec::with_capacity(ids.len());
        let mut dead = 0u32;
        for id in ids {
            let exists: bool = conn.exists(self.record_key(&id)).await?;
            if exists {
                live.push(id);
            } else {
                let _: u64 = conn.srem(&index_key, &id).await?;
                dead += 1;
            }
        }
        if dead > 0 {
            tracing::debug!(
                user_id = %user_id,
                dead_count = dead,
                live_count = live.len(),
                "pruned dead index references"
            );
        }
        Ok(live)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let full_pattern = format!("{}{pattern}", self.prefix);
        let mut keys = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(&full_pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        let mut ids: Vec<String> = keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
            // Index sets share the prefix; a record scan must not
            // return them.
            .filter(|id| !id.starts_with("user_sessions:"))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let ids = self.scan(pattern).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn_manager.clone();
        let mut deleted = 0u64;
        for batch in ids.chunks(DELETE_BATCH) {
            let mut pipe = redis::pipe();
            for id in batch {
                pipe.del(self.record_key(id));
            }
            let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
            deleted += counts.iter().sum::<u64>();
        }
        tracing::debug!(pattern, deleted, "bulk-deleted records from redis");
        Ok(deleted)
    }
}
