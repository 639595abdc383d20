//! Hybrid storage backend: fast store plus durable mirror.
//!
//! Every session mutation is written to a fast backend (Redis,
//! Memcached or memory) and mirrored into the relational backend.
//! Reads and authentication decisions come from the fast side only,
//! so request latency never depends on the database; the durable side
//! is the restart-surviving audit copy.
//!
//! A durable-side failure is logged and swallowed. Auth must keep
//! working through a database outage, at the cost of an audit gap.

use crate::error::Result;
use crate::records::{SessionRecord, UserId};
use crate::storage::SessionStorage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

/// Session storage that pairs a fast backend with a durable mirror.
pub struct HybridSessionStorage {
    fast: Arc<dyn SessionStorage<SessionRecord>>,
    durable: Arc<dyn SessionStorage<SessionRecord>>,
}

impl HybridSessionStorage {
    /// Compose a fast store and a durable mirror.
    #[must_use]
    pub fn new(
        fast: Arc<dyn SessionStorage<SessionRecord>>,
        durable: Arc<dyn SessionStorage<SessionRecord>>,
    ) -> Self {
        Self { fast, durable }
    }

    fn log_durable_failure(op: &'static str, key: &str, err: &crate::error::SessionError) {
        error!(op, key, error = %err, "durable session mirror write failed");
    }
}

#[async_trait]
impl SessionStorage<SessionRecord> for HybridSessionStorage {
    async fn create(&self, record: &SessionRecord, key: Option<&str>) -> Result<String> {
        let id = self.fast.create(record, key).await?;
        if let Err(err) = self.durable.create(record, Some(&id)).await {
            Self::log_durable_failure("create", &id, &err);
        }
        Ok(id)
    }

    async fn get(&self, key: &str) -> Result<Option<SessionRecord>> {
        self.fast.get(key).await
    }

    async fn update(&self, key: &str, record: &SessionRecord) -> Result<bool> {
        let updated = self.fast.update(key, record).await?;
        if updated {
            // The fast side may have expired a record the durable side
            // still holds; mirroring with create keeps them aligned.
            if let Err(err) = self.durable.create(record, Some(key)).await {
                Self::log_durable_failure("update", key, &err);
            }
        }
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self.fast.delete(key).await?;
        if let Err(err) = self.durable.delete(key).await {
            Self::log_durable_failure("delete", key, &err);
        }
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.fast.exists(key).await
    }

    async fn get_user_sessions(&self, user_id: UserId) -> Result<Vec<String>> {
        self.fast.get_user_sessions(user_id).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.fast.scan(pattern).await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let deleted = self.fast.delete_pattern(pattern).await?;
        if let Err(err) = self.durable.delete_pattern(pattern).await {
            Self::log_durable_failure("delete_pattern", pattern, &err);
        }
        Ok(deleted)
    }

    async fn close(&self) -> Result<()> {
        self.fast.close().await?;
        self.durable.close().await
    }
}
