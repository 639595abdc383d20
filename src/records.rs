//! Core record types for the session security state.
//!
//! Everything that crosses a storage backend is defined here. All
//! records serialize as JSON so the memory, Redis, Memcached and
//! database backends store byte-identical payloads.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Metadata key stamped on termination with the reason string.
pub const META_TERMINATION_REASON: &str = "termination_reason";
/// Metadata key stamped on termination with an RFC 3339 timestamp.
pub const META_TERMINATED_AT: &str = "terminated_at";
/// Metadata key stamped on other sessions when a concurrent login lands.
pub const META_CONCURRENT_LOGIN: &str = "concurrent_login";

// ═══════════════════════════════════════════════════════════════════════
// Ids
// ═══════════════════════════════════════════════════════════════════════

/// Unique identifier for an admin user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Storage marker
// ═══════════════════════════════════════════════════════════════════════

/// Marker for record types the storage backends can persist.
///
/// `index_user_id` lets generic backends maintain the per-user
/// secondary index without knowing the concrete record type; records
/// that are not user-scoped return `None` and stay out of the index.
pub trait StoredRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// User id under which this record is indexed, if any.
    fn index_user_id(&self) -> Option<UserId> {
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Device info
// ═══════════════════════════════════════════════════════════════════════

/// Device information parsed from a User-Agent header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Browser family (e.g. "Chrome"), or "Other".
    pub browser: String,
    /// Browser version string, possibly empty.
    pub browser_version: String,
    /// Operating system family (e.g. "Windows"), or "Other".
    pub os: String,
    /// Device family (e.g. "iPhone"), or "Other".
    pub device: String,
    /// Phone-class device.
    pub is_mobile: bool,
    /// Tablet-class device.
    pub is_tablet: bool,
    /// Desktop-class device.
    pub is_pc: bool,
}

// ═══════════════════════════════════════════════════════════════════════
// Session record
// ═══════════════════════════════════════════════════════════════════════

/// Server-side session record binding a user to a bearer token.
///
/// Lifecycle: created on login, refreshed on every validated request,
/// flipped to inactive on logout/timeout/capacity eviction. Once
/// `is_active` is `false` the record is terminal; nothing flips it
/// back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque, globally unique session token.
    pub session_id: String,

    /// Owning user.
    pub user_id: UserId,

    /// Client address the session is bound to.
    pub ip_address: IpAddr,

    /// Raw User-Agent header value.
    pub user_agent: String,

    /// Parsed device information.
    pub device_info: DeviceInfo,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last validated activity. Monotonically non-decreasing while
    /// the session is active.
    pub last_activity: DateTime<Utc>,

    /// `false` once the session is terminated (terminal state).
    pub is_active: bool,

    /// Open metadata bag: login type, termination stamps,
    /// concurrent-login markers.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SessionRecord {
    /// Refresh `last_activity`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Flip the record to its terminal inactive state and stamp the
    /// reason into metadata. A second call changes nothing.
    pub fn terminate(&mut self, reason: &str, now: DateTime<Utc>) {
        if !self.is_active {
            return;
        }
        self.is_active = false;
        self.metadata.insert(
            META_TERMINATION_REASON.to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        self.metadata.insert(
            META_TERMINATED_AT.to_string(),
            serde_json::Value::String(now.to_rfc3339()),
        );
    }

    /// Whether `last_activity` is older than `timeout` as of `now`.
    #[must_use]
    pub fn is_timed_out(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_activity > timeout
    }
}

impl StoredRecord for SessionRecord {
    fn index_user_id(&self) -> Option<UserId> {
        Some(self.user_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// CSRF record
// ═══════════════════════════════════════════════════════════════════════

/// CSRF token bound 1:1 to a session.
///
/// Stored keyed by *session id* so regeneration overwrites in place;
/// the previous token becomes unusable the instant a new one is
/// issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfRecord {
    /// The secret token value handed to the client.
    pub token: String,
    /// Owning user.
    pub user_id: UserId,
    /// Session this token is bound to.
    pub session_id: String,
    /// Hard expiry; expired records are deleted on validation.
    pub expires_at: DateTime<Utc>,
}

impl CsrfRecord {
    /// Whether the token is past its hard expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl StoredRecord for CsrfRecord {}

// ═══════════════════════════════════════════════════════════════════════
// Rate limit record
// ═══════════════════════════════════════════════════════════════════════

/// Counter record for fixed-window rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Attempts recorded in the current window.
    pub count: u64,
    /// Window start, epoch seconds.
    pub first_attempt: i64,
}

impl RateLimitRecord {
    /// Whether the window that began at `first_attempt` has elapsed.
    #[must_use]
    pub const fn window_elapsed(&self, now_epoch: i64, window_seconds: i64) -> bool {
        now_epoch - self.first_attempt > window_seconds
    }
}

impl StoredRecord for RateLimitRecord {}

// ═══════════════════════════════════════════════════════════════════════
// Request context
// ═══════════════════════════════════════════════════════════════════════

/// Framework-neutral view of an incoming request.
///
/// The HTTP layer (out of scope here) builds one of these from
/// whatever request type it has; the session core never touches a web
/// framework directly.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Socket peer address, if the transport provides one.
    pub peer_addr: Option<IpAddr>,
    /// Raw `X-Forwarded-For` header value, if present.
    pub forwarded_for: Option<String>,
    /// Raw `User-Agent` header value, if present.
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Context for a direct connection from `peer_addr`.
    #[must_use]
    pub fn new(peer_addr: IpAddr) -> Self {
        Self {
            peer_addr: Some(peer_addr),
            ..Self::default()
        }
    }

    /// Attach a forwarded-for header value.
    #[must_use]
    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    /// Attach a raw User-Agent header value.
    #[must_use]
    pub fn with_user_agent(mut self, header: impl Into<String>) -> Self {
        self.user_agent = Some(header.into());
        self
    }

    /// Resolve the client address: the first parseable entry of the
    /// forwarded-for header wins, otherwise the socket peer address.
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        if let Some(header) = &self.forwarded_for {
            if let Some(first) = header.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
        self.peer_addr
    }
}
