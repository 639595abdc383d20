//! Session lifecycle orchestration.
//!
//! [`SessionManager`] owns the security decisions: session creation
//! with per-user capacity enforcement, activity-based validation and
//! timeout, CSRF token issue/validate/rotate, login throttling, and
//! periodic cleanup. Storage backends only move records; every rule
//! lives here so it is identical across backends.

use crate::config::SessionManagerConfig;
use crate::error::{Result, SessionError};
use crate::rate_limiter::SimpleRateLimiter;
use crate::records::{
    CsrfRecord, RequestContext, SessionRecord, UserId, META_CONCURRENT_LOGIN,
};
use crate::storage::SessionStorage;
use crate::user_agent::parse_user_agent;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Termination reason recorded when a session idles out.
pub const REASON_TIMEOUT: &str = "session_timeout";
/// Termination reason recorded on explicit logout.
pub const REASON_LOGOUT: &str = "logout";
/// Termination reason recorded when the per-user cap evicts a session.
pub const REASON_SESSION_LIMIT: &str = "session_limit_exceeded";
/// Termination reason recorded by "log out everywhere".
pub const REASON_ADMIN_TERMINATION: &str = "admin_termination";

/// Orchestrates sessions, CSRF tokens and login throttling over
/// pluggable storage.
pub struct SessionManager {
    sessions: Arc<dyn SessionStorage<SessionRecord>>,
    csrf: Arc<dyn SessionStorage<CsrfRecord>>,
    rate_limiter: Option<SimpleRateLimiter>,
    config: SessionManagerConfig,
    last_cleanup: Mutex<DateTime<Utc>>,
}

impl SessionManager {
    /// Assemble a manager from its stores.
    ///
    /// With `rate_limiter` set to `None` login throttling is disabled
    /// and every attempt is allowed.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStorage<SessionRecord>>,
        csrf: Arc<dyn SessionStorage<CsrfRecord>>,
        rate_limiter: Option<SimpleRateLimiter>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            sessions,
            csrf,
            rate_limiter,
            config,
            // Epoch start so the first cleanup call actually runs.
            last_cleanup: Mutex::new(DateTime::UNIX_EPOCH),
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════
    // Session lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Create a session for `user_id` from an incoming request.
    ///
    /// Resolves the client address (forwarded-for header first, then
    /// socket peer), parses the User-Agent into device info, evicts
    /// the user's least-recently-active sessions while they are at or
    /// over the per-user cap, then persists the session and a bound
    /// CSRF token.
    ///
    /// Returns `(session_id, csrf_token)`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidRequest`] when no client address
    /// can be resolved, or a storage error if persistence fails.
    pub async fn create_session(
        &self,
        user_id: UserId,
        ctx: &RequestContext,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<(String, String)> {
        let Some(ip_address) = ctx.client_ip() else {
            return Err(SessionError::InvalidRequest(
                "cannot determine client address".into(),
            ));
        };
        let user_agent = ctx.user_agent.clone().unwrap_or_default();
        let device_info = parse_user_agent(&user_agent);

        self.enforce_session_limit(user_id).await?;

        let now = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id,
            ip_address,
            user_agent,
            device_info,
            created_at: now,
            last_activity: now,
            is_active: true,
            metadata: metadata.unwrap_or_default(),
        };
        self.sessions.create(&record, Some(&session_id)).await?;
        let csrf_token = self.issue_csrf_token(&session_id, user_id, now).await?;

        info!(
            session_id = %session_id,
            user_id = %user_id,
            ip = %ip_address,
            browser = %record.device_info.browser,
            "session created"
        );
        Ok((session_id, csrf_token))
    }

    /// Validate a session and, by default, refresh its activity stamp.
    ///
    /// Returns `None` for unknown, inactive or timed-out sessions; a
    /// timed-out session is terminated as a side effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails.
    pub async fn validate_session(
        &self,
        session_id: &str,
        update_activity: bool,
    ) -> Result<Option<SessionRecord>> {
        let Some(mut record) = self.sessions.get(session_id).await? else {
            return Ok(None);
        };
        if !record.is_active {
            return Ok(None);
        }
        let now = Utc::now();
        if record.is_timed_out(self.config.session_timeout(), now) {
            self.terminate_session(session_id, REASON_TIMEOUT).await?;
            return Ok(None);
        }
        if update_activity {
            record.touch(now);
            self.sessions.update(session_id, &record).await?;
        }
        Ok(Some(record))
    }

    /// Refresh a session's activity stamp without other validation
    /// side effects. Returns `false` for unknown or inactive sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails.
    pub async fn update_activity(&self, session_id: &str) -> Result<bool> {
        let Some(mut record) = self.sessions.get(session_id).await? else {
            return Ok(false);
        };
        if !record.is_active {
            return Ok(false);
        }
        record.touch(Utc::now());
        self.sessions.update(session_id, &record).await
    }

    /// Terminate a session, stamping `reason` into its metadata and
    /// dropping its CSRF token. Returns `false` when there was no
    /// active session to terminate.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails.
    pub async fn terminate_session(&self, session_id: &str, reason: &str) -> Result<bool> {
        let Some(mut record) = self.sessions.get(session_id).await? else {
            return Ok(false);
        };
        if !record.is_active {
            return Ok(false);
        }
        record.terminate(reason, Utc::now());
        self.sessions.update(session_id, &record).await?;
        self.csrf.delete(session_id).await?;

        info!(session_id = %session_id, user_id = %record.user_id, reason, "session terminated");
        Ok(true)
    }

    /// Terminate every active session of a user ("log out
    /// everywhere"). Returns how many sessions were terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails.
    pub async fn terminate_user_sessions(&self, user_id: UserId) -> Result<usize> {
        let mut terminated = 0;
        for record in self.get_user_active_sessions(user_id).await? {
            if self
                .terminate_session(&record.session_id, REASON_ADMIN_TERMINATION)
                .await?
            {
                terminated += 1;
            }
        }
        Ok(terminated)
    }

    /// All currently active sessions of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails.
    pub async fn get_user_active_sessions(&self, user_id: UserId) -> Result<Vec<SessionRecord>> {
        let mut active = Vec::new();
        for id in self.sessions.get_user_sessions(user_id).await? {
            if let Some(record) = self.sessions.get(&id).await? {
                if record.is_active {
                    active.push(record);
                }
            }
        }
        Ok(active)
    }

    /// Raw session fetch without validation side effects. Terminated
    /// sessions are returned as-is, which is what admin tooling wants.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails.
    pub async fn get_session_metadata(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.sessions.get(session_id).await
    }

    /// Mark every *other* active session of the user with a
    /// concurrent-login stamp naming the new session. Admin UIs use
    /// this to surface simultaneous logins.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails.
    pub async fn handle_concurrent_login(
        &self,
        user_id: UserId,
        current_session_id: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let stamp = serde_json::json!({
            "timestamp": now.to_rfc3339(),
            "new_session_id": current_session_id,
        });
        for mut record in self.get_user_active_sessions(user_id).await? {
            if record.session_id == current_session_id {
                continue;
            }
            record
                .metadata
                .insert(META_CONCURRENT_LOGIN.to_string(), stamp.clone());
            self.sessions.update(&record.session_id, &record).await?;
        }
        Ok(())
    }

    /// Evict least-recently-active sessions while the user is at or
    /// over the cap, so one slot is free for the session about to be
    /// created. Ties on activity fall back to creation order.
    async fn enforce_session_limit(&self, user_id: UserId) -> Result<()> {
        let mut active = self.get_user_active_sessions(user_id).await?;
        if active.len() < self.config.max_sessions_per_user {
            return Ok(());
        }
        active.sort_by(|a, b| {
            a.last_activity
                .cmp(&b.last_activity)
                .then(a.created_at.cmp(&b.created_at))
        });
        let evict = active.len() + 1 - self.config.max_sessions_per_user;
        for record in active.into_iter().take(evict) {
            warn!(
                user_id = %user_id,
                session_id = %record.session_id,
                "session limit reached, evicting oldest session"
            );
            self.terminate_session(&record.session_id, REASON_SESSION_LIMIT)
                .await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // CSRF tokens
    // ═══════════════════════════════════════════════════════════════════

    /// Check a CSRF token against the one bound to `session_id`.
    /// Expired tokens are deleted on sight and rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the token store fails.
    pub async fn validate_csrf_token(&self, session_id: &str, token: &str) -> Result<bool> {
        let Some(record) = self.csrf.get(session_id).await? else {
            return Ok(false);
        };
        if record.is_expired(Utc::now()) {
            self.csrf.delete(session_id).await?;
            return Ok(false);
        }
        Ok(record.session_id == session_id && record.token == token)
    }

    /// Rotate the CSRF token of an active session, invalidating the
    /// previous one in place. Returns `None` when the session is
    /// unknown or inactive.
    ///
    /// # Errors
    ///
    /// Returns an error if a store fails.
    pub async fn regenerate_csrf_token(&self, session_id: &str) -> Result<Option<String>> {
        let Some(record) = self.sessions.get(session_id).await? else {
            return Ok(None);
        };
        if !record.is_active {
            return Ok(None);
        }
        let token = self
            .issue_csrf_token(session_id, record.user_id, Utc::now())
            .await?;
        Ok(Some(token))
    }

    /// Write a fresh token record keyed by session id, overwriting
    /// any previous token for that session.
    async fn issue_csrf_token(
        &self,
        session_id: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let token = generate_token();
        let record = CsrfRecord {
            token: token.clone(),
            user_id,
            session_id: session_id.to_string(),
            expires_at: now + self.config.session_timeout(),
        };
        self.csrf.create(&record, Some(session_id)).await?;
        Ok(token)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Login throttling
    // ═══════════════════════════════════════════════════════════════════

    /// Record a login attempt and decide whether the client may keep
    /// trying. Returns `(allowed, remaining_attempts)`.
    ///
    /// Attempts count per source address and per username; whichever
    /// counter is higher governs, so neither rotating usernames from
    /// one address nor spraying one account from many addresses slips
    /// through. A successful login forgives both counters.
    ///
    /// Counter-store failures fail open: an outage must not lock every
    /// admin out, so the attempt is allowed and the error is logged.
    pub async fn track_login_attempt(
        &self,
        ip: &str,
        username: &str,
        success: bool,
    ) -> (bool, Option<u64>) {
        let Some(limiter) = &self.rate_limiter else {
            return (true, None);
        };
        let ip_key = format!("login:ip:{ip}");
        let user_key = format!("login:user:{username}");

        if success {
            for key in [&ip_key, &user_key] {
                if let Err(err) = limiter.delete(key).await {
                    error!(key = %key, error = %err, "failed to reset login counter");
                }
            }
            return (true, None);
        }

        let window = self.config.login_window();
        let ip_count = limiter.increment(&ip_key, 1, window).await;
        let user_count = limiter.increment(&user_key, 1, window).await;
        let effective = match (ip_count, user_count) {
            (Ok(ip_count), Ok(user_count)) => ip_count.max(user_count),
            (Err(err), _) | (_, Err(err)) => {
                error!(ip, username, error = %err, "login counter unavailable, failing open");
                return (true, None);
            }
        };

        let max = self.config.login_max_attempts;
        let allowed = effective <= max;
        if !allowed {
            warn!(ip, username, attempts = effective, "login attempts over limit");
        }
        (allowed, Some(max.saturating_sub(effective)))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Cleanup
    // ═══════════════════════════════════════════════════════════════════

    /// Terminate timed-out sessions and drop expired CSRF tokens.
    ///
    /// Time-gated: runs at most once per configured cleanup interval,
    /// so it can be called on every request cheaply. Backends without
    /// a key scan skip the sweep and rely on TTL expiry instead.
    ///
    /// Returns the number of sessions terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if a store fails mid-sweep.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let now = Utc::now();
        {
            let mut last = self.last_cleanup.lock().await;
            if now - *last < self.config.cleanup_interval() {
                return Ok(0);
            }
            *last = now;
        }

        let timeout = self.config.session_timeout();
        let mut terminated = 0u64;
        for id in self.sessions.scan("*").await? {
            if let Some(record) = self.sessions.get(&id).await? {
                if record.is_active && record.is_timed_out(timeout, now) {
                    self.terminate_session(&id, REASON_TIMEOUT).await?;
                    terminated += 1;
                }
            }
        }
        for id in self.csrf.scan("*").await? {
            if let Some(record) = self.csrf.get(&id).await? {
                if record.is_expired(now) {
                    self.csrf.delete(&id).await?;
                }
            }
        }

        if terminated > 0 {
            info!(terminated, "expired sessions cleaned up");
        }
        Ok(terminated)
    }

    /// Drop all login-throttling counters. No-op without a rate
    /// limiter or on scanless backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter store fails.
    pub async fn cleanup_rate_limits(&self) -> Result<u64> {
        match &self.rate_limiter {
            Some(limiter) => limiter.delete_pattern("login:*").await,
            None => Ok(0),
        }
    }
}

/// 32 random bytes, URL-safe base64. Used for CSRF tokens.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::records::RateLimitRecord;
    use crate::storage::MemorySessionStorage;
    use async_trait::async_trait;
    use std::time::Duration;

    fn manager(config: SessionManagerConfig) -> SessionManager {
        let rate_storage: Arc<dyn SessionStorage<RateLimitRecord>> =
            Arc::new(MemorySessionStorage::new(None));
        SessionManager::new(
            Arc::new(MemorySessionStorage::new(None)),
            Arc::new(MemorySessionStorage::new(None)),
            Some(SimpleRateLimiter::new(rate_storage)),
            config,
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new("192.0.2.10".parse().unwrap()).with_user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        )
    }

    #[tokio::test]
    async fn test_create_and_validate_round_trip() {
        let mgr = manager(SessionManagerConfig::default());
        let (session_id, csrf_token) =
            mgr.create_session(UserId(1), &ctx(), None).await.unwrap();

        let record = mgr.validate_session(&session_id, true).await.unwrap().unwrap();
        assert_eq!(record.user_id, UserId(1));
        assert_eq!(record.ip_address, "192.0.2.10".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(record.device_info.browser, "Chrome");
        assert!(record.device_info.is_pc);
        assert!(mgr.validate_csrf_token(&session_id, &csrf_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_refreshes_activity() {
        let mgr = manager(SessionManagerConfig::default());
        let (session_id, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();

        let before = mgr.get_session_metadata(&session_id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.validate_session(&session_id, true).await.unwrap();
        let after = mgr.get_session_metadata(&session_id).await.unwrap().unwrap();
        assert!(after.last_activity > before.last_activity);

        // Peeking must not move the stamp.
        let peeked = mgr.validate_session(&session_id, false).await.unwrap().unwrap();
        let again = mgr.get_session_metadata(&session_id).await.unwrap().unwrap();
        assert_eq!(peeked.last_activity, after.last_activity);
        assert_eq!(again.last_activity, after.last_activity);
    }

    #[tokio::test]
    async fn test_validate_unknown_session() {
        let mgr = manager(SessionManagerConfig::default());
        assert!(mgr.validate_session("nope", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timed_out_session_is_terminated() {
        let config = SessionManagerConfig {
            session_timeout_minutes: 0,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(config);
        let (session_id, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(mgr.validate_session(&session_id, true).await.unwrap().is_none());
        let record = mgr.get_session_metadata(&session_id).await.unwrap().unwrap();
        assert!(!record.is_active);
        assert_eq!(
            record.metadata.get("termination_reason"),
            Some(&serde_json::Value::String(REASON_TIMEOUT.into()))
        );
    }

    #[tokio::test]
    async fn test_session_limit_evicts_least_recently_active() {
        let config = SessionManagerConfig {
            max_sessions_per_user: 2,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(config);

        let (first, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (second, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch the first session so the second becomes the oldest.
        mgr.validate_session(&first, true).await.unwrap();
        let (third, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();

        let active = mgr.get_user_active_sessions(UserId(1)).await.unwrap();
        let ids: Vec<&str> = active.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(active.len(), 2);
        assert!(ids.contains(&first.as_str()));
        assert!(ids.contains(&third.as_str()));

        let evicted = mgr.get_session_metadata(&second).await.unwrap().unwrap();
        assert!(!evicted.is_active);
        assert_eq!(
            evicted.metadata.get("termination_reason"),
            Some(&serde_json::Value::String(REASON_SESSION_LIMIT.into()))
        );
    }

    #[tokio::test]
    async fn test_create_session_without_client_address() {
        let mgr = manager(SessionManagerConfig::default());
        let result = mgr
            .create_session(UserId(1), &RequestContext::default(), None)
            .await;
        assert!(matches!(result, Err(SessionError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_forwarded_for_wins_over_peer_address() {
        let mgr = manager(SessionManagerConfig::default());
        let ctx = ctx().with_forwarded_for("203.0.113.9, 10.0.0.1");
        let (session_id, _) = mgr.create_session(UserId(1), &ctx, None).await.unwrap();
        let record = mgr.get_session_metadata(&session_id).await.unwrap().unwrap();
        assert_eq!(record.ip_address.to_string(), "203.0.113.9");
    }

    #[tokio::test]
    async fn test_terminate_session_kills_csrf() {
        let mgr = manager(SessionManagerConfig::default());
        let (session_id, csrf_token) =
            mgr.create_session(UserId(1), &ctx(), None).await.unwrap();

        assert!(mgr.terminate_session(&session_id, REASON_LOGOUT).await.unwrap());
        assert!(mgr.validate_session(&session_id, true).await.unwrap().is_none());
        assert!(!mgr.validate_csrf_token(&session_id, &csrf_token).await.unwrap());
        // Already terminated.
        assert!(!mgr.terminate_session(&session_id, REASON_LOGOUT).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_user_sessions() {
        let mgr = manager(SessionManagerConfig::default());
        for _ in 0..3 {
            mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        }
        mgr.create_session(UserId(2), &ctx(), None).await.unwrap();

        assert_eq!(mgr.terminate_user_sessions(UserId(1)).await.unwrap(), 3);
        assert!(mgr.get_user_active_sessions(UserId(1)).await.unwrap().is_empty());
        assert_eq!(mgr.get_user_active_sessions(UserId(2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_csrf_regeneration_invalidates_old_token() {
        let mgr = manager(SessionManagerConfig::default());
        let (session_id, old_token) =
            mgr.create_session(UserId(1), &ctx(), None).await.unwrap();

        let new_token = mgr.regenerate_csrf_token(&session_id).await.unwrap().unwrap();
        assert_ne!(old_token, new_token);
        assert!(!mgr.validate_csrf_token(&session_id, &old_token).await.unwrap());
        assert!(mgr.validate_csrf_token(&session_id, &new_token).await.unwrap());

        assert!(mgr.regenerate_csrf_token("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_csrf_rejects_wrong_token() {
        let mgr = manager(SessionManagerConfig::default());
        let (session_id, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        assert!(!mgr.validate_csrf_token(&session_id, "forged").await.unwrap());
        assert!(!mgr.validate_csrf_token("unknown", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_login_throttling_blocks_after_limit() {
        let config = SessionManagerConfig {
            login_max_attempts: 3,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(config);

        for expected_remaining in [2, 1, 0] {
            let (allowed, remaining) =
                mgr.track_login_attempt("1.2.3.4", "alice", false).await;
            assert!(allowed);
            assert_eq!(remaining, Some(expected_remaining));
        }
        let (allowed, remaining) = mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        assert!(!allowed);
        assert_eq!(remaining, Some(0));
    }

    #[tokio::test]
    async fn test_login_throttling_counts_per_ip_across_usernames() {
        let config = SessionManagerConfig {
            login_max_attempts: 2,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(config);

        // Rotating usernames does not help: the address counter governs.
        mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        mgr.track_login_attempt("1.2.3.4", "bob", false).await;
        let (allowed, _) = mgr.track_login_attempt("1.2.3.4", "carol", false).await;
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_successful_login_resets_counters() {
        let config = SessionManagerConfig {
            login_max_attempts: 3,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(config);

        mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        let (allowed, remaining) = mgr.track_login_attempt("1.2.3.4", "alice", true).await;
        assert!(allowed);
        assert_eq!(remaining, None);

        let (_, remaining) = mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        assert_eq!(remaining, Some(2));
    }

    #[tokio::test]
    async fn test_throttling_disabled_without_limiter() {
        let mgr = SessionManager::new(
            Arc::new(MemorySessionStorage::new(None)),
            Arc::new(MemorySessionStorage::new(None)),
            None,
            SessionManagerConfig::default(),
        );
        for _ in 0..50 {
            let (allowed, remaining) = mgr.track_login_attempt("1.2.3.4", "alice", false).await;
            assert!(allowed);
            assert_eq!(remaining, None);
        }
    }

    /// Counter store that always fails, standing in for a backend
    /// outage.
    struct FailingStorage;

    #[async_trait]
    impl SessionStorage<RateLimitRecord> for FailingStorage {
        async fn create(&self, _: &RateLimitRecord, _: Option<&str>) -> crate::error::Result<String> {
            Err(SessionError::InvalidRequest("down".into()))
        }
        async fn get(&self, _: &str) -> crate::error::Result<Option<RateLimitRecord>> {
            Err(SessionError::InvalidRequest("down".into()))
        }
        async fn update(&self, _: &str, _: &RateLimitRecord) -> crate::error::Result<bool> {
            Err(SessionError::InvalidRequest("down".into()))
        }
        async fn delete(&self, _: &str) -> crate::error::Result<bool> {
            Err(SessionError::InvalidRequest("down".into()))
        }
        async fn exists(&self, _: &str) -> crate::error::Result<bool> {
            Err(SessionError::InvalidRequest("down".into()))
        }
        async fn get_user_sessions(&self, _: UserId) -> crate::error::Result<Vec<String>> {
            Err(SessionError::InvalidRequest("down".into()))
        }
    }

    #[tokio::test]
    async fn test_throttling_fails_open_on_storage_failure() {
        let mgr = SessionManager::new(
            Arc::new(MemorySessionStorage::new(None)),
            Arc::new(MemorySessionStorage::new(None)),
            Some(SimpleRateLimiter::new(Arc::new(FailingStorage))),
            SessionManagerConfig::default(),
        );
        let (allowed, remaining) = mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        assert!(allowed);
        assert_eq!(remaining, None);
        // Success path also swallows the failure.
        let (allowed, _) = mgr.track_login_attempt("1.2.3.4", "alice", true).await;
        assert!(allowed);
    }

    #[tokio::test]
    async fn test_concurrent_login_stamps_other_sessions() {
        let mgr = manager(SessionManagerConfig::default());
        let (first, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        let (second, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();

        mgr.handle_concurrent_login(UserId(1), &second).await.unwrap();

        let stamped = mgr.get_session_metadata(&first).await.unwrap().unwrap();
        let marker = stamped.metadata.get("concurrent_login").unwrap();
        assert_eq!(marker["new_session_id"], second);

        let current = mgr.get_session_metadata(&second).await.unwrap().unwrap();
        assert!(!current.metadata.contains_key("concurrent_login"));
    }

    #[tokio::test]
    async fn test_update_activity() {
        let mgr = manager(SessionManagerConfig::default());
        let (session_id, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        let before = mgr.get_session_metadata(&session_id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(mgr.update_activity(&session_id).await.unwrap());
        let after = mgr.get_session_metadata(&session_id).await.unwrap().unwrap();
        assert!(after.last_activity > before.last_activity);

        assert!(!mgr.update_activity("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_terminates_stale_sessions_and_is_gated() {
        let config = SessionManagerConfig {
            session_timeout_minutes: 0,
            cleanup_interval_minutes: 60,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(config);

        let (a, _) = mgr.create_session(UserId(1), &ctx(), None).await.unwrap();
        let (b, _) = mgr.create_session(UserId(2), &ctx(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(mgr.cleanup_expired_sessions().await.unwrap(), 2);
        for id in [&a, &b] {
            let record = mgr.get_session_metadata(id).await.unwrap().unwrap();
            assert!(!record.is_active);
        }

        // Within the interval the sweep is skipped entirely.
        mgr.create_session(UserId(3), &ctx(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mgr.cleanup_expired_sessions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_rate_limits() {
        let mgr = manager(SessionManagerConfig::default());
        mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        mgr.track_login_attempt("5.6.7.8", "bob", false).await;

        assert_eq!(mgr.cleanup_rate_limits().await.unwrap(), 4);
        let (_, remaining) = mgr.track_login_attempt("1.2.3.4", "alice", false).await;
        assert_eq!(
            remaining,
            Some(mgr.config().login_max_attempts - 1)
        );
    }
}
