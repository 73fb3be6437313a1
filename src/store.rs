//! Durable storage for readings and sessions.
//!
//! Owns the SQLite schema and executes batched, transactional writes.
//! A failed row inside a batch is logged and skipped without aborting
//! the transaction; only a transaction-level failure fails the whole
//! batch so the ingestion buffer can requeue it.

use crate::buffer::{BatchInsertResult, BufferedReading, ReadingSink, SinkError};
use crate::config::DatabaseConfig;
use crate::model::{Reading, SensorType, Session, SessionStatus};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Stored row is corrupt: {0}")]
    CorruptRow(String),
}

/// Result of a batched insert
#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome {
    /// Rows committed
    pub inserted: usize,
    /// Rows attempted
    pub total: usize,
}

/// A reading as persisted, including its row id and insert time
#[derive(Debug, Clone)]
pub struct StoredReading {
    pub id: i64,
    pub device_id: String,
    pub recorded_at: i64,
    pub sensor_type: SensorType,
    pub value: Value,
    pub session_id: Option<String>,
    pub inserted_at: i64,
}

#[derive(FromRow)]
struct ReadingRow {
    id: i64,
    device_id: String,
    recorded_at: i64,
    sensor_type: String,
    value: String,
    session_id: Option<String>,
    inserted_at: i64,
}

impl ReadingRow {
    fn into_stored(self) -> Result<StoredReading, StoreError> {
        let sensor_type = SensorType::parse(&self.sensor_type)
            .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
        let value = serde_json::from_str(&self.value)
            .map_err(|e| StoreError::CorruptRow(format!("reading {}: {}", self.id, e)))?;
        Ok(StoredReading {
            id: self.id,
            device_id: self.device_id,
            recorded_at: self.recorded_at,
            sensor_type,
            value,
            session_id: self.session_id,
            inserted_at: self.inserted_at,
        })
    }
}

#[derive(FromRow)]
struct SessionRow {
    session_id: String,
    device_id: String,
    started_at: i64,
    ended_at: Option<i64>,
    status: String,
    description: String,
    metadata: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session, StoreError> {
        let status = SessionStatus::parse(&self.status).ok_or_else(|| {
            StoreError::CorruptRow(format!(
                "session {} has unknown status {}",
                self.session_id, self.status
            ))
        })?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| StoreError::CorruptRow(format!("session {}: {}", self.session_id, e)))?;
        Ok(Session {
            session_id: self.session_id,
            device_id: self.device_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            status,
            description: self.description,
            metadata,
        })
    }
}

/// SQLite-backed store for readings and sessions
pub struct TelemetryStore {
    pool: SqlitePool,
}

impl TelemetryStore {
    /// Open a connection pool against the configured database
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(url = %config.url, "Connected to SQLite database");

        Ok(Self { pool })
    }

    /// Build a store over an existing pool (used by tests)
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a batch of readings in one transaction.
    ///
    /// Row-level failures (constraint violations, dangling session
    /// references) are logged and skipped; the rest of the batch still
    /// commits. Transaction-level failures fail the whole batch.
    #[instrument(skip(self, batch), fields(total = batch.len()))]
    pub async fn insert_batch(&self, batch: &[BufferedReading]) -> Result<BatchOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted_at = Utc::now().timestamp_millis();
        let mut inserted = 0_usize;

        for buffered in batch {
            let reading = &buffered.reading;
            let value = reading.value.to_string();
            let result = sqlx::query(
                r#"
                INSERT INTO readings (
                    device_id, recorded_at, sensor_type, value,
                    session_id, enqueued_at, inserted_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&reading.device_id)
            .bind(reading.recorded_at)
            .bind(reading.sensor_type.as_str())
            .bind(&value)
            .bind(&reading.session_id)
            .bind(buffered.enqueued_at)
            .bind(inserted_at)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => inserted += 1,
                Err(e) => {
                    warn!(
                        device_id = %reading.device_id,
                        sensor_type = %reading.sensor_type.as_str(),
                        error = %e,
                        "Dropping reading that failed to insert"
                    );
                    metrics::counter!("store.rows.failed").increment(1);
                }
            }
        }

        tx.commit().await?;

        metrics::counter!("store.readings.inserted").increment(inserted as u64);
        metrics::counter!("store.batches.committed").increment(1);

        debug!(inserted, total = batch.len(), "Batch committed");

        Ok(BatchOutcome {
            inserted,
            total: batch.len(),
        })
    }

    /// Create a session row. Fails with a unique violation if the
    /// device already has an active session.
    pub async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, device_id, started_at, ended_at, status, description, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.device_id)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.status.as_str())
        .bind(&session.description)
        .bind(session.metadata.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the most recent active session for a device, if any
    pub async fn get_active_session(&self, device_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, device_id, started_at, ended_at, status, description, metadata
            FROM sessions
            WHERE device_id = ? AND status = 'active'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Resolve the device's active session, creating one if absent.
    ///
    /// Returns the session and whether it was newly created. When two
    /// callers race, the unique active-session index makes the loser's
    /// insert fail and it re-reads the winner's row.
    pub async fn get_or_create_active_session(
        &self,
        device_id: &str,
    ) -> Result<(Session, bool), StoreError> {
        if let Some(existing) = self.get_active_session(device_id).await? {
            return Ok((existing, false));
        }

        let session = Session::new_active(device_id);
        match self.create_session(&session).await {
            Ok(()) => {
                info!(
                    device_id = %device_id,
                    session_id = %session.session_id,
                    "Created recording session"
                );
                Ok((session, true))
            }
            Err(StoreError::Database(e)) if is_unique_violation(&e) => {
                let existing = self
                    .get_active_session(device_id)
                    .await?
                    .ok_or_else(|| StoreError::SessionNotFound(device_id.to_string()))?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Mark a session completed and stamp its end time
    pub async fn end_session(&self, session_id: &str) -> Result<(), StoreError> {
        let ended_at = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE sessions SET ended_at = ?, status = 'completed' WHERE session_id = ?",
        )
        .bind(ended_at)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        info!(session_id = %session_id, "Session completed");
        Ok(())
    }

    /// Get a session by id
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, device_id, started_at, ended_at, status, description, metadata
            FROM sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// List sessions for a device, most recent first
    pub async fn list_sessions(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, device_id, started_at, ended_at, status, description, metadata
            FROM sessions
            WHERE device_id = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Readings for one device within an optional time range
    pub async fn readings_by_device(
        &self,
        device_id: &str,
        start: Option<i64>,
        end: Option<i64>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, device_id, recorded_at, sensor_type, value, session_id, inserted_at
            FROM readings
            WHERE device_id = ?
              AND (? IS NULL OR recorded_at >= ?)
              AND (? IS NULL OR recorded_at < ?)
            ORDER BY recorded_at DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(start)
        .bind(end)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReadingRow::into_stored).collect()
    }

    /// Readings of one sensor type within an optional time range
    pub async fn readings_by_type(
        &self,
        sensor_type: SensorType,
        start: Option<i64>,
        end: Option<i64>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, device_id, recorded_at, sensor_type, value, session_id, inserted_at
            FROM readings
            WHERE sensor_type = ?
              AND (? IS NULL OR recorded_at >= ?)
              AND (? IS NULL OR recorded_at < ?)
            ORDER BY recorded_at DESC
            LIMIT ?
            "#,
        )
        .bind(sensor_type.as_str())
        .bind(start)
        .bind(start)
        .bind(end)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReadingRow::into_stored).collect()
    }

    /// All readings captured within a session, in recording order
    pub async fn readings_by_session(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, device_id, recorded_at, sensor_type, value, session_id, inserted_at
            FROM readings
            WHERE session_id = ?
            ORDER BY recorded_at ASC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReadingRow::into_stored).collect()
    }

    /// The most recent reading from a device
    pub async fn latest_reading(
        &self,
        device_id: &str,
    ) -> Result<Option<StoredReading>, StoreError> {
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT id, device_id, recorded_at, sensor_type, value, session_id, inserted_at
            FROM readings
            WHERE device_id = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReadingRow::into_stored).transpose()
    }

    /// Distinct devices that have stored readings
    pub async fn list_devices(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT device_id FROM readings ORDER BY device_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(d,)| d).collect())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait::async_trait]
impl ReadingSink for TelemetryStore {
    async fn insert_batch(&self, batch: &[BufferedReading]) -> Result<BatchInsertResult, SinkError> {
        let outcome = TelemetryStore::insert_batch(self, batch)
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        Ok(BatchInsertResult {
            inserted: outcome.inserted,
            total: outcome.total,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Fresh in-memory store with migrations applied.
    pub(crate) async fn memory_store() -> TelemetryStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // The acquire-time ping awaits sqlite's worker thread behind a
            // timeout timer; under a paused tokio clock that timer fires
            // before the real thread can reply. Skip it so acquire is
            // synchronously ready in time-paused tests.
            .test_before_acquire(false)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should open");
        let store = TelemetryStore::with_pool(pool);
        store.run_migrations().await.expect("migrations should run");
        store
    }

    pub(crate) fn accel_reading(device_id: &str, session_id: Option<&str>) -> BufferedReading {
        BufferedReading {
            reading: Reading {
                device_id: device_id.to_string(),
                recorded_at: Utc::now().timestamp_millis(),
                sensor_type: SensorType::Accelerometer,
                value: json!({"x": 0.1, "y": -0.2, "z": 9.8}),
                session_id: session_id.map(String::from),
            },
            enqueued_at: Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn inserts_batch_and_reads_back() {
        let store = memory_store().await;

        let batch: Vec<_> = (0..5).map(|_| accel_reading("AMR-001", None)).collect();
        let outcome = store.insert_batch(&batch).await.unwrap();
        assert_eq!(outcome.inserted, 5);
        assert_eq!(outcome.total, 5);

        let readings = store
            .readings_by_device("AMR-001", None, None, 100)
            .await
            .unwrap();
        assert_eq!(readings.len(), 5);
        assert_eq!(readings[0].sensor_type, SensorType::Accelerometer);
        assert_eq!(readings[0].value["z"], json!(9.8));
    }

    #[tokio::test]
    async fn bad_row_does_not_abort_batch() {
        let store = memory_store().await;

        // Middle reading references a session that does not exist, so
        // its foreign key check fails while the rest commit.
        let batch = vec![
            accel_reading("AMR-001", None),
            accel_reading("AMR-001", Some("no-such-session")),
            accel_reading("AMR-001", None),
        ];

        let outcome = store.insert_batch(&batch).await.unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.total, 3);

        let readings = store
            .readings_by_device("AMR-001", None, None, 100)
            .await
            .unwrap();
        assert_eq!(readings.len(), 2);
    }

    #[tokio::test]
    async fn get_or_create_reuses_active_session() {
        let store = memory_store().await;

        let (first, is_new) = store.get_or_create_active_session("AMR-002").await.unwrap();
        assert!(is_new);
        assert_eq!(first.status, SessionStatus::Active);

        let (second, is_new) = store.get_or_create_active_session("AMR-002").await.unwrap();
        assert!(!is_new);
        assert_eq!(second.session_id, first.session_id);
    }

    #[tokio::test]
    async fn second_active_session_insert_is_rejected() {
        let store = memory_store().await;

        let (_, _) = store.get_or_create_active_session("AMR-003").await.unwrap();

        // A direct insert that bypasses get-or-create loses to the
        // partial unique index.
        let rogue = Session::new_active("AMR-003");
        let err = store.create_session(&rogue).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(e) if is_unique_violation(&e)));
    }

    #[tokio::test]
    async fn end_session_sets_completed_and_end_time() {
        let store = memory_store().await;

        let (session, _) = store.get_or_create_active_session("AMR-004").await.unwrap();
        store.end_session(&session.session_id).await.unwrap();

        let ended = store
            .get_session(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.status, SessionStatus::Completed);
        assert!(ended.ended_at.is_some());

        // Device can start a new session afterwards.
        let (next, is_new) = store.get_or_create_active_session("AMR-004").await.unwrap();
        assert!(is_new);
        assert_ne!(next.session_id, session.session_id);
    }

    #[tokio::test]
    async fn end_unknown_session_errors() {
        let store = memory_store().await;
        let err = store.end_session("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn queries_by_type_session_and_latest() {
        let store = memory_store().await;

        let (session, _) = store.get_or_create_active_session("AMR-005").await.unwrap();

        let mut batch = vec![
            accel_reading("AMR-005", Some(&session.session_id)),
            accel_reading("AMR-005", Some(&session.session_id)),
        ];
        batch.push(BufferedReading {
            reading: Reading {
                device_id: "AMR-006".to_string(),
                recorded_at: Utc::now().timestamp_millis() + 10,
                sensor_type: SensorType::Gps,
                value: json!({"latitude": 46.5, "longitude": 6.6}),
                session_id: None,
            },
            enqueued_at: Utc::now().timestamp_millis(),
        });

        store.insert_batch(&batch).await.unwrap();

        let gps = store
            .readings_by_type(SensorType::Gps, None, None, 10)
            .await
            .unwrap();
        assert_eq!(gps.len(), 1);
        assert_eq!(gps[0].device_id, "AMR-006");

        let in_session = store
            .readings_by_session(&session.session_id, 10)
            .await
            .unwrap();
        assert_eq!(in_session.len(), 2);

        let latest = store.latest_reading("AMR-006").await.unwrap().unwrap();
        assert_eq!(latest.sensor_type, SensorType::Gps);

        let devices = store.list_devices().await.unwrap();
        assert_eq!(devices, vec!["AMR-005".to_string(), "AMR-006".to_string()]);
    }
}
