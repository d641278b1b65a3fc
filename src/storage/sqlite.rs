//! SQLite-backed session store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{EventId, IdleEvent, Session, SessionId, SessionStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    machine_id TEXT NOT NULL,
    login_time TEXT NOT NULL,
    logout_time TEXT,
    total_idle_seconds INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS idle_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    idle_start TEXT NOT NULL,
    idle_end TEXT,
    duration_seconds INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_idle_events_session ON idle_events(session_id);
"#;

/// Boxed future returned by a unit of work run inside a transaction.
type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 't>>;

/// Session store backed by a pooled SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the database at `url`, creating the file and schema if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        info!("Session store ready: {}", url);
        Ok(store)
    }

    /// Remove a session and, through the cascade, its idle events.
    #[cfg(test)]
    pub(crate) async fn delete_session(&self, session_id: SessionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Run `op` inside a transaction that commits when it returns `Ok` and
    /// rolls back on every other exit path.
    async fn in_transaction<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut SqliteConnection) -> TxFuture<'t, T> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let outcome = op(&mut *tx).await;
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback failed after {}: {}", e, rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// Checks that an idle event exists and has not been closed yet.
async fn ensure_event_open(conn: &mut SqliteConnection, event_id: EventId) -> Result<(), StoreError> {
    let idle_end: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT idle_end FROM idle_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&mut *conn)
            .await?;

    match idle_end {
        None => Err(StoreError::NotFound { kind: "idle event", id: event_id }),
        Some(Some(_)) => Err(StoreError::AlreadyClosed { kind: "idle event", id: event_id }),
        Some(None) => Ok(()),
    }
}

async fn write_idle_end(
    conn: &mut SqliteConnection,
    event_id: EventId,
    idle_end: DateTime<Utc>,
    duration_seconds: i64,
) -> Result<(), StoreError> {
    ensure_event_open(conn, event_id).await?;

    sqlx::query("UPDATE idle_events SET idle_end = ?, duration_seconds = ? WHERE event_id = ?")
        .bind(idle_end)
        .bind(duration_seconds.max(0))
        .bind(event_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(
        &self,
        user_id: &str,
        machine_id: &str,
        login_time: DateTime<Utc>,
    ) -> Result<SessionId, StoreError> {
        let user_id = user_id.to_string();
        let machine_id = machine_id.to_string();

        self.in_transaction(move |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    "INSERT INTO sessions (user_id, machine_id, login_time, total_idle_seconds) \
                     VALUES (?, ?, ?, 0)",
                )
                .bind(user_id)
                .bind(machine_id)
                .bind(login_time)
                .execute(&mut *conn)
                .await?;

                Ok::<_, StoreError>(result.last_insert_rowid())
            })
        })
        .await
    }

    async fn close_session(
        &self,
        session_id: SessionId,
        logout_time: DateTime<Utc>,
        total_idle_seconds: i64,
    ) -> Result<(), StoreError> {
        self.in_transaction(move |conn| {
            Box::pin(async move {
                let logout: Option<Option<DateTime<Utc>>> =
                    sqlx::query_scalar("SELECT logout_time FROM sessions WHERE session_id = ?")
                        .bind(session_id)
                        .fetch_optional(&mut *conn)
                        .await?;

                match logout {
                    None => return Err(StoreError::NotFound { kind: "session", id: session_id }),
                    Some(Some(_)) => {
                        return Err(StoreError::AlreadyClosed { kind: "session", id: session_id })
                    }
                    Some(None) => {}
                }

                sqlx::query(
                    "UPDATE sessions SET logout_time = ?, total_idle_seconds = ? WHERE session_id = ?",
                )
                .bind(logout_time)
                .bind(total_idle_seconds.max(0))
                .bind(session_id)
                .execute(&mut *conn)
                .await?;

                Ok::<_, StoreError>(())
            })
        })
        .await
    }

    async fn create_idle_event(
        &self,
        session_id: SessionId,
        idle_start: DateTime<Utc>,
    ) -> Result<EventId, StoreError> {
        self.in_transaction(move |conn| {
            Box::pin(async move {
                let open: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM idle_events WHERE session_id = ? AND idle_end IS NULL",
                )
                .bind(session_id)
                .fetch_one(&mut *conn)
                .await?;

                if open > 0 {
                    return Err(StoreError::OpenIdleEventExists { session_id });
                }

                let result = sqlx::query(
                    "INSERT INTO idle_events (session_id, idle_start, idle_end, duration_seconds) \
                     VALUES (?, ?, NULL, 0)",
                )
                .bind(session_id)
                .bind(idle_start)
                .execute(&mut *conn)
                .await?;

                Ok::<_, StoreError>(result.last_insert_rowid())
            })
        })
        .await
    }

    async fn close_idle_event(
        &self,
        event_id: EventId,
        idle_end: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<(), StoreError> {
        self.in_transaction(move |conn| {
            Box::pin(async move { write_idle_end(conn, event_id, idle_end, duration_seconds).await })
        })
        .await
    }

    async fn close_idle_event_and_accumulate(
        &self,
        event_id: EventId,
        idle_end: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<(), StoreError> {
        self.in_transaction(move |conn| {
            Box::pin(async move {
                write_idle_end(conn, event_id, idle_end, duration_seconds).await?;

                let updated = sqlx::query(
                    "UPDATE sessions SET total_idle_seconds = total_idle_seconds + ? \
                     WHERE session_id = (SELECT session_id FROM idle_events WHERE event_id = ?)",
                )
                .bind(duration_seconds.max(0))
                .bind(event_id)
                .execute(&mut *conn)
                .await?
                .rows_affected();

                if updated == 0 {
                    warn!("Owning session of idle event {} not found; total not updated", event_id);
                }

                debug!("Closed idle event {} ({}s)", event_id, duration_seconds);
                Ok::<_, StoreError>(())
            })
        })
        .await
    }

    async fn sum_idle_durations(&self, session_id: SessionId) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(duration_seconds), 0) FROM idle_events WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT session_id, user_id, machine_id, login_time, logout_time, total_idle_seconds \
             FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn get_idle_event(&self, event_id: EventId) -> Result<Option<IdleEvent>, StoreError> {
        let event = sqlx::query_as::<_, IdleEvent>(
            "SELECT event_id, session_id, idle_start, idle_end, duration_seconds \
             FROM idle_events WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    async fn idle_events(&self, session_id: SessionId) -> Result<Vec<IdleEvent>, StoreError> {
        let events = sqlx::query_as::<_, IdleEvent>(
            "SELECT event_id, session_id, idle_start, idle_end, duration_seconds \
             FROM idle_events WHERE session_id = ? ORDER BY idle_start, event_id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    /// Open a store in a fresh temporary directory. Keep the directory alive
    /// for as long as the store is used.
    pub(crate) async fn temp_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("tracker.db").display());
        let store = SqliteStore::connect(&url, 2).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_close_session() {
        let (_dir, store) = temp_store().await;
        let login = Utc::now();

        let id = store.create_session("alice", "WC-01", login).await.unwrap();
        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.user_id, "alice");
        assert_eq!(session.machine_id, "WC-01");
        assert_eq!(session.total_idle_seconds, 0);
        assert!(!session.is_closed());

        let logout = login + ChronoDuration::minutes(5);
        assert_ok!(store.close_session(id, logout, 42).await);

        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.logout_time, Some(logout));
        assert_eq!(session.total_idle_seconds, 42);
    }

    #[tokio::test]
    async fn test_session_ids_increase() {
        let (_dir, store) = temp_store().await;
        let first = store.create_session("alice", "WC-01", Utc::now()).await.unwrap();
        let second = store.create_session("bob", "WC-02", Utc::now()).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_logout_time_is_set_once() {
        let (_dir, store) = temp_store().await;
        let id = store.create_session("alice", "WC-01", Utc::now()).await.unwrap();
        store.close_session(id, Utc::now(), 0).await.unwrap();

        let err = store.close_session(id, Utc::now(), 10).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyClosed { .. }));

        let session = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(session.total_idle_seconds, 0);
    }

    #[tokio::test]
    async fn test_close_missing_session_is_not_found() {
        let (_dir, store) = temp_store().await;
        let err = store.close_session(999, Utc::now(), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "session", id: 999 }));
        assert!(err.is_missing_row());
    }

    #[tokio::test]
    async fn test_idle_event_accumulates_into_session() {
        let (_dir, store) = temp_store().await;
        let login = Utc::now();
        let session_id = store.create_session("alice", "WC-01", login).await.unwrap();

        let start = login + ChronoDuration::seconds(30);
        let event_id = store.create_idle_event(session_id, start).await.unwrap();
        let event = store.get_idle_event(event_id).await.unwrap().unwrap();
        assert!(event.is_open());
        assert_eq!(event.duration_seconds, 0);

        let end = start + ChronoDuration::seconds(75);
        store
            .close_idle_event_and_accumulate(event_id, end, 75)
            .await
            .unwrap();

        let event = store.get_idle_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.idle_end, Some(end));
        assert_eq!(event.duration_seconds, 75);

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.total_idle_seconds, 75);
        assert_eq!(store.sum_idle_durations(session_id).await.unwrap(), 75);
    }

    #[tokio::test]
    async fn test_only_one_open_idle_event_per_session() {
        let (_dir, store) = temp_store().await;
        let session_id = store.create_session("alice", "WC-01", Utc::now()).await.unwrap();

        store.create_idle_event(session_id, Utc::now()).await.unwrap();
        let err = store.create_idle_event(session_id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::OpenIdleEventExists { .. }));

        let events = store.idle_events(session_id).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.is_open()).count(), 1);
    }

    #[tokio::test]
    async fn test_closing_idle_event_twice_is_rejected() {
        let (_dir, store) = temp_store().await;
        let session_id = store.create_session("alice", "WC-01", Utc::now()).await.unwrap();
        let event_id = store.create_idle_event(session_id, Utc::now()).await.unwrap();

        store.close_idle_event(event_id, Utc::now(), 3).await.unwrap();
        let err = store
            .close_idle_event_and_accumulate(event_id, Utc::now(), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyClosed { .. }));

        // Rolled back: the session total must not have been bumped.
        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.total_idle_seconds, 0);
    }

    #[tokio::test]
    async fn test_negative_duration_is_stored_as_zero() {
        let (_dir, store) = temp_store().await;
        let session_id = store.create_session("alice", "WC-01", Utc::now()).await.unwrap();
        let event_id = store.create_idle_event(session_id, Utc::now()).await.unwrap();

        store.close_idle_event(event_id, Utc::now(), -7).await.unwrap();
        let event = store.get_idle_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.duration_seconds, 0);
    }

    #[tokio::test]
    async fn test_failed_unit_of_work_rolls_back() {
        let (_dir, store) = temp_store().await;

        let result: Result<(), StoreError> = store
            .in_transaction(|conn| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO sessions (user_id, machine_id, login_time) VALUES ('x', 'y', ?)",
                    )
                    .bind(Utc::now())
                    .execute(&mut *conn)
                    .await?;
                    Err::<(), _>(StoreError::NotFound { kind: "session", id: 0 })
                })
            })
            .await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_deleting_session_cascades_to_idle_events() {
        let (_dir, store) = temp_store().await;
        let session_id = store.create_session("alice", "WC-01", Utc::now()).await.unwrap();
        let event_id = store.create_idle_event(session_id, Utc::now()).await.unwrap();

        store.delete_session(session_id).await.unwrap();

        assert!(store.get_idle_event(event_id).await.unwrap().is_none());
    }
}
