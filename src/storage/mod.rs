//! Storage backends for session, CSRF and rate-limit records.
//!
//! Every backend implements [`SessionStorage`] and is held by the
//! manager as `Arc<dyn SessionStorage<T>>`, so the backend is picked
//! at runtime from configuration. Records are serialized as JSON, and
//! keys are namespaced by a per-store prefix (`session:`, `csrf:`,
//! `rate_limit:`) so one transport can carry all three stores.

use crate::error::Result;
use crate::records::{StoredRecord, UserId};
use async_trait::async_trait;

pub mod database;
pub mod hybrid;
pub mod memcached;
pub mod memory;
pub mod redis;

pub use database::DatabaseSessionStorage;
pub use hybrid::HybridSessionStorage;
pub use memcached::MemcachedSessionStorage;
pub use memory::MemorySessionStorage;
pub use redis::RedisSessionStorage;

/// Async key/value store for one record type.
///
/// Keys passed in and handed back are *unprefixed* ids; each backend
/// applies its own prefix on the wire. TTL policy is fixed at
/// construction time, not per call.
///
/// `scan` and `delete_pattern` are best effort: backends without a
/// native key scan return nothing, and callers must treat an empty
/// result as "unsupported", not "no keys". TTL expiry keeps those
/// backends clean instead.
#[async_trait]
pub trait SessionStorage<T: StoredRecord>: Send + Sync {
    /// Persist a new record and return its id.
    ///
    /// When `key` is `None` a fresh UUID is generated. An existing
    /// record under the same key is overwritten. If the record is
    /// user-scoped it is added to the per-user index.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the backend write fails.
    async fn create(&self, record: &T, key: Option<&str>) -> Result<String>;

    /// Fetch a record by id, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read or deserialization fails.
    async fn get(&self, key: &str) -> Result<Option<T>>;

    /// Overwrite an existing record, refreshing its TTL.
    ///
    /// Returns `false` without writing when the key does not exist;
    /// updates never resurrect expired records.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the backend write fails.
    async fn update(&self, key: &str, record: &T) -> Result<bool>;

    /// Remove a record. Returns `true` if something was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend delete fails.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live record exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Ids of all records indexed under `user_id`.
    ///
    /// Dead index entries (records that expired underneath the index)
    /// are pruned as a side effect where the backend allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    async fn get_user_sessions(&self, user_id: UserId) -> Result<Vec<String>>;

    /// Ids matching a glob-style pattern (`*` wildcard).
    ///
    /// Backends without a native scan return an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend scan fails.
    async fn scan(&self, _pattern: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Delete all records whose id matches `pattern`, returning the
    /// count. Backends without a native scan delete nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend scan or delete fails.
    async fn delete_pattern(&self, _pattern: &str) -> Result<u64> {
        Ok(0)
    }

    /// Release the underlying transport. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend teardown fails.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Glob match supporting `*` only, the subset the backends need for
/// `login:*`-style patterns.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == key,
        Some((prefix, rest)) => {
            let Some(tail) = key.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            tail.char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(tail.len()))
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("login:*", "login:ip:1.2.3.4"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("login:*:alice", "login:user:alice"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("login:*", "csrf:abc"));
        assert!(!glob_match("login:*:alice", "login:user:bob"));
        assert!(!glob_match("exact", "exactly"));
    }
}
