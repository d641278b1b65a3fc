//! MySQL-backed session store for shared deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::{EventId, IdleEvent, Session, SessionId, SessionStore, StoreError};

const SCHEMA: [&str; 2] = [
    r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    user_id VARCHAR(255) NOT NULL,
    machine_id VARCHAR(255) NOT NULL,
    login_time DATETIME(6) NOT NULL,
    logout_time DATETIME(6) NULL,
    total_idle_seconds BIGINT NOT NULL DEFAULT 0
) ENGINE=InnoDB
"#,
    r#"
CREATE TABLE IF NOT EXISTS idle_events (
    event_id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    session_id BIGINT NOT NULL,
    idle_start DATETIME(6) NOT NULL,
    idle_end DATETIME(6) NULL,
    duration_seconds BIGINT NOT NULL DEFAULT 0,
    INDEX idx_idle_events_session (session_id),
    CONSTRAINT fk_idle_events_session FOREIGN KEY (session_id)
        REFERENCES sessions (session_id) ON DELETE CASCADE
) ENGINE=InnoDB
"#,
];

type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 't>>;

/// Session store backed by a pooled MySQL (or MariaDB) server.
#[derive(Debug, Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Connect to the server at `url` and create the schema if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = MySqlConnectOptions::from_str(url)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        // Credentials stay out of the log.
        info!("Session store ready: mysql");
        Ok(Self { pool })
    }

    async fn in_transaction<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut MySqlConnection) -> TxFuture<'t, T> + Send,
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

async fn write_idle_end(
    conn: &mut MySqlConnection,
    event_id: EventId,
    idle_end: DateTime<Utc>,
    duration_seconds: i64,
) -> Result<(), StoreError> {
    let current: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT idle_end FROM idle_events WHERE event_id = ? FOR UPDATE")
            .bind(event_id)
            .fetch_optional(&mut *conn)
            .await?;

    match current {
        None => return Err(StoreError::NotFound { kind: "idle event", id: event_id }),
        Some(Some(_)) => return Err(StoreError::AlreadyClosed { kind: "idle event", id: event_id }),
        Some(None) => {}
    }

    sqlx::query("UPDATE idle_events SET idle_end = ?, duration_seconds = ? WHERE event_id = ?")
        .bind(idle_end)
        .bind(duration_seconds.max(0))
        .bind(event_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[async_trait]
impl SessionStore for MySqlStore {
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

                Ok::<_, StoreError>(result.last_insert_id() as SessionId)
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
                let logout: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
                    "SELECT logout_time FROM sessions WHERE session_id = ? FOR UPDATE",
                )
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
                // Lock the owning session so two writers cannot both open an interval.
                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT session_id FROM sessions WHERE session_id = ? FOR UPDATE")
                        .bind(session_id)
                        .fetch_optional(&mut *conn)
                        .await?;
                if exists.is_none() {
                    return Err(StoreError::NotFound { kind: "session", id: session_id });
                }

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

                Ok::<_, StoreError>(result.last_insert_id() as EventId)
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
                    "UPDATE sessions s JOIN idle_events e ON e.session_id = s.session_id \
                     SET s.total_idle_seconds = s.total_idle_seconds + ? \
                     WHERE e.event_id = ?",
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
        // SUM over BIGINT yields DECIMAL in MySQL.
        let total: i64 = sqlx::query_scalar(
            "SELECT CAST(COALESCE(SUM(duration_seconds), 0) AS SIGNED) \
             FROM idle_events WHERE session_id = ?",
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
