//! Fixed-window rate limiting over the storage abstraction.
//!
//! One counter record per key. The first increment opens a window;
//! later increments inside the window add up; an increment after the
//! window has elapsed resets the counter instead. Deleting the key
//! forgives all attempts, which is what a successful login does.
//!
//! The read-modify-write here is not atomic across processes. Two
//! racing increments can undercount by one, which for login throttling
//! only delays lockout by a single attempt.

use crate::error::Result;
use crate::records::RateLimitRecord;
use crate::storage::SessionStorage;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Key prefix for rate-limit counters within their store.
pub const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// Fixed-window counter backed by any [`SessionStorage`].
#[derive(Clone)]
pub struct SimpleRateLimiter {
    storage: Arc<dyn SessionStorage<RateLimitRecord>>,
}

impl SimpleRateLimiter {
    /// Wrap a counter store.
    #[must_use]
    pub fn new(storage: Arc<dyn SessionStorage<RateLimitRecord>>) -> Self {
        Self { storage }
    }

    /// Add `amount` attempts to `key`'s window and return the total.
    ///
    /// Opens a fresh window when the key is new or the previous
    /// window has elapsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter store fails.
    pub async fn increment(&self, key: &str, amount: u64, window: Duration) -> Result<u64> {
        let now = Utc::now().timestamp();
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);

        let fresh = RateLimitRecord {
            count: amount,
            first_attempt: now,
        };
        match self.storage.get(key).await? {
            None => {
                self.storage.create(&fresh, Some(key)).await?;
                Ok(amount)
            }
            Some(record) if record.window_elapsed(now, window_secs) => {
                // New window; create also refreshes the storage TTL.
                self.storage.create(&fresh, Some(key)).await?;
                Ok(amount)
            }
            Some(record) => {
                let bumped = RateLimitRecord {
                    count: record.count.saturating_add(amount),
                    first_attempt: record.first_attempt,
                };
                if self.storage.update(key, &bumped).await? {
                    Ok(bumped.count)
                } else {
                    // Expired between read and write; start over.
                    self.storage.create(&fresh, Some(key)).await?;
                    Ok(amount)
                }
            }
        }
    }

    /// Current count for `key`, zero when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter store fails.
    pub async fn get_count(&self, key: &str) -> Result<u64> {
        Ok(self.storage.get(key).await?.map_or(0, |record| record.count))
    }

    /// Forget all attempts for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter store fails.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.storage.delete(key).await
    }

    /// Drop every counter matching `pattern`. Backends without a key
    /// scan delete nothing and rely on TTL expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter store fails.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        self.storage.delete_pattern(pattern).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemorySessionStorage;

    fn limiter() -> SimpleRateLimiter {
        SimpleRateLimiter::new(Arc::new(MemorySessionStorage::new(None)))
    }

    #[tokio::test]
    async fn test_counts_accumulate_within_window() {
        let limiter = limiter();
        let window = Duration::from_secs(60);
        assert_eq!(limiter.increment("k", 1, window).await.unwrap(), 1);
        assert_eq!(limiter.increment("k", 1, window).await.unwrap(), 2);
        assert_eq!(limiter.increment("k", 1, window).await.unwrap(), 3);
        assert_eq!(limiter.get_count("k").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_custom_increment_amount() {
        let limiter = limiter();
        let window = Duration::from_secs(60);
        assert_eq!(limiter.increment("k", 5, window).await.unwrap(), 5);
        assert_eq!(limiter.increment("k", 3, window).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        let window = Duration::from_secs(60);
        limiter.increment("a", 1, window).await.unwrap();
        limiter.increment("a", 1, window).await.unwrap();
        limiter.increment("b", 1, window).await.unwrap();
        assert_eq!(limiter.get_count("a").await.unwrap(), 2);
        assert_eq!(limiter.get_count("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_forgives_attempts() {
        let limiter = limiter();
        let window = Duration::from_secs(60);
        limiter.increment("k", 4, window).await.unwrap();
        assert!(limiter.delete("k").await.unwrap());
        assert_eq!(limiter.get_count("k").await.unwrap(), 0);
        // Next increment starts a fresh window.
        assert_eq!(limiter.increment("k", 1, window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_count_absent_key_is_zero() {
        assert_eq!(limiter().get_count("never-seen").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_window_reset_after_elapse() {
        let limiter = limiter();
        let window = Duration::from_secs(1);
        assert_eq!(limiter.increment("k", 3, window).await.unwrap(), 3);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        // Window elapsed, the counter starts over.
        assert_eq!(limiter.increment("k", 1, window).await.unwrap(), 1);
    }
}
