//! Error types for session storage and security-state operations.

use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error taxonomy for the session core.
///
/// Only genuinely exceptional conditions live here. An invalid, expired
/// or missing session is an *expected* everyday outcome and is reported
/// as `None`/`false` by the relevant operation, never as an error.
#[derive(Debug, Error)]
pub enum SessionError {
    // ═══════════════════════════════════════════════════════════
    // Configuration
    // ═══════════════════════════════════════════════════════════

    /// Invalid or conflicting backend configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    // ═══════════════════════════════════════════════════════════
    // Connectivity (surfaced from the backend client, not wrapped)
    // ═══════════════════════════════════════════════════════════

    /// Redis client error.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// Memcached client error.
    #[error(transparent)]
    Memcached(#[from] async_memcached::Error),

    /// Database error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    // ═══════════════════════════════════════════════════════════
    // Data handling
    // ═══════════════════════════════════════════════════════════

    /// Stored record could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The incoming request cannot be bound to a session.
    ///
    /// Raised when session creation sees no resolvable client address;
    /// a session with no bindable IP is a security risk.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SessionError {
    /// Returns `true` if this error originates in backend connectivity.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Redis(_) | Self::Memcached(_) | Self::Database(_)
        )
    }

    /// Returns `true` if this error is a configuration problem the
    /// operator must fix (retrying will not help).
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
