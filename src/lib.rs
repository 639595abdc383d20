//! Session and security-state management for admin interfaces.
//!
//! This crate is the server-side security core behind an admin panel:
//! session records with device fingerprints, per-session CSRF tokens,
//! login throttling and periodic cleanup, all over pluggable storage.
//!
//! # Architecture
//!
//! - [`SessionManager`] owns every security rule: capacity
//!   enforcement, activity timeout, token rotation, throttling.
//! - [`storage::SessionStorage`] is the backend seam. Memory, Redis,
//!   Memcached, PostgreSQL and a hybrid fast+durable composition all
//!   implement it, so the rules are identical across deployments.
//! - [`config::SessionBackendConfig`] selects the backend at runtime;
//!   [`config::build_session_manager`] wires everything up.
//!
//! Session ids are opaque UUIDs handed to the client as bearer
//! tokens; everything of value stays server-side. CSRF tokens are
//! bound one-to-one to sessions and die with them.
//!
//! # Example
//!
//! ```no_run
//! use admin_session::config::{build_session_manager, SessionBackendConfig, SessionManagerConfig};
//! use admin_session::records::{RequestContext, UserId};
//!
//! # async fn example() -> admin_session::Result<()> {
//! let manager = build_session_manager(
//!     &SessionBackendConfig::Memory,
//!     SessionManagerConfig::default(),
//! )
//! .await?;
//!
//! let ctx = RequestContext::new("203.0.113.7".parse().unwrap())
//!     .with_user_agent("Mozilla/5.0 ...");
//! let (session_id, csrf_token) = manager.create_session(UserId(1), &ctx, None).await?;
//!
//! if let Some(session) = manager.validate_session(&session_id, true).await? {
//!     assert!(session.is_active);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod rate_limiter;
pub mod records;
pub mod storage;
pub mod user_agent;

pub use config::{
    build_session_manager, DatabaseConfig, MemcachedConfig, RedisConfig, SessionBackendConfig,
    SessionManagerConfig,
};
pub use error::{Result, SessionError};
pub use manager::SessionManager;
pub use rate_limiter::SimpleRateLimiter;
pub use records::{
    CsrfRecord, DeviceInfo, RateLimitRecord, RequestContext, SessionRecord, StoredRecord, UserId,
};
pub use storage::{
    DatabaseSessionStorage, HybridSessionStorage, MemcachedSessionStorage, MemorySessionStorage,
    RedisSessionStorage, SessionStorage,
};
pub use user_agent::parse_user_agent;
