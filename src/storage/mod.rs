//! Durable storage for sessions and idle intervals.

mod mysql;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use mysql::MySqlStore;
pub use sqlite::SqliteStore;

#[cfg(test)]
pub(crate) use sqlite::tests::temp_store;

/// Store-assigned session identifier.
pub type SessionId = i64;

/// Store-assigned idle event identifier.
pub type EventId = i64;

/// One login-to-logout tracking interval for a user on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub machine_id: String,
    pub login_time: DateTime<Utc>,
    /// Null until the session is closed.
    pub logout_time: Option<DateTime<Utc>>,
    pub total_idle_seconds: i64,
}

impl Session {
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.logout_time.is_some()
    }
}

/// A contiguous span of inactivity within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdleEvent {
    pub event_id: EventId,
    pub session_id: SessionId,
    pub idle_start: DateTime<Utc>,
    /// Null while the interval is still open.
    pub idle_end: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
}

impl IdleEvent {
    pub fn is_open(&self) -> bool {
        self.idle_end.is_none()
    }
}

/// Errors raised by a [`SessionStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("{kind} {id} is already closed")]
    AlreadyClosed { kind: &'static str, id: i64 },

    #[error("session {session_id} already has an open idle event")]
    OpenIdleEventExists { session_id: SessionId },

    #[error("unsupported store URL scheme: {0}")]
    UnsupportedUrl(String),
}

impl StoreError {
    /// True when the targeted row no longer exists or can no longer be written.
    pub fn is_missing_row(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::AlreadyClosed { .. })
    }
}

/// Persistence interface consumed by the session controller and idle detector.
///
/// Every write runs in its own transaction: it commits on success and rolls
/// back on any error, which is returned to the caller unchanged.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        user_id: &str,
        machine_id: &str,
        login_time: DateTime<Utc>,
    ) -> Result<SessionId, StoreError>;

    /// Sets `logout_time` (exactly once) and the final idle total.
    async fn close_session(
        &self,
        session_id: SessionId,
        logout_time: DateTime<Utc>,
        total_idle_seconds: i64,
    ) -> Result<(), StoreError>;

    async fn create_idle_event(
        &self,
        session_id: SessionId,
        idle_start: DateTime<Utc>,
    ) -> Result<EventId, StoreError>;

    async fn close_idle_event(
        &self,
        event_id: EventId,
        idle_end: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<(), StoreError>;

    /// Closes an idle event and adds its duration to the owning session's
    /// running total in a single transaction.
    async fn close_idle_event_and_accumulate(
        &self,
        event_id: EventId,
        idle_end: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<(), StoreError>;

    async fn sum_idle_durations(&self, session_id: SessionId) -> Result<i64, StoreError>;

    async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError>;

    async fn get_idle_event(&self, event_id: EventId) -> Result<Option<IdleEvent>, StoreError>;

    /// All idle events of a session, oldest first.
    async fn idle_events(&self, session_id: SessionId) -> Result<Vec<IdleEvent>, StoreError>;
}

/// Database engine behind a store URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    MySql,
}

impl Backend {
    /// Pick the engine from the URL scheme.
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" => Ok(Self::MySql),
            _ => Err(StoreError::UnsupportedUrl(scheme.to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => f.write_str("sqlite"),
            Self::MySql => f.write_str("mysql"),
        }
    }
}

/// Open the store named by `url`, creating the schema if needed.
pub async fn connect(url: &str, max_connections: u32) -> Result<Arc<dyn SessionStore>, StoreError> {
    let store: Arc<dyn SessionStore> = match Backend::from_url(url)? {
        Backend::Sqlite => Arc::new(SqliteStore::connect(url, max_connections).await?),
        Backend::MySql => Arc::new(MySqlStore::connect(url, max_connections).await?),
    };
    Ok(store)
}
