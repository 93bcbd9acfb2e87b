//! SQLite persistence for the communication log
//!
//! This module provides:
//! - `SqliteCommunicationLog`, a [`CommunicationLog`] backed by a SQLite pool
//! - Automatic migrations for the `communication_logs` table

#[cfg(feature = "storage")]
use crate::error::{Error, Result};
#[cfg(feature = "storage")]
use crate::log::{CommunicationLog, CommunicationLogEntry, LogQuery};
#[cfg(feature = "storage")]
use async_trait::async_trait;
#[cfg(feature = "storage")]
use chrono::{DateTime, SecondsFormat, Utc};

#[cfg(feature = "storage")]
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
#[cfg(feature = "storage")]
use sqlx::{Pool, Row, Sqlite};
#[cfg(feature = "storage")]
use std::str::FromStr;

/// SQLite-backed communication log
#[cfg(feature = "storage")]
pub struct SqliteCommunicationLog {
    pool: Pool<Sqlite>,
}

#[cfg(feature = "storage")]
impl SqliteCommunicationLog {
    /// Connect and run migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true);

        // an in-memory database exists per connection
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| Error::storage(format!("Failed to connect to SQLite: {}", e)))?;

        let log = Self { pool };
        log.run_migrations().await?;

        Ok(log)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS communication_logs (
                id TEXT PRIMARY KEY,
                correlation_id TEXT NOT NULL,
                source_agent TEXT NOT NULL,
                target_agent TEXT NOT NULL,
                message_type TEXT NOT NULL,
                success INTEGER NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                metadata_json TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to create communication_logs table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_communication_logs_correlation ON communication_logs(correlation_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to create index: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_communication_logs_created ON communication_logs(created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to create index: {}", e)))?;

        Ok(())
    }
}

// Fixed-width UTC timestamps compare correctly as text.
#[cfg(feature = "storage")]
fn encode_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(feature = "storage")]
#[async_trait]
impl CommunicationLog for SqliteCommunicationLog {
    async fn append(&self, entry: &CommunicationLogEntry) -> Result<()> {
        let metadata_json = serde_json::to_string(&entry.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO communication_logs
            (id, correlation_id, source_agent, target_agent, message_type, success,
             execution_time_ms, error_message, created_at, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.correlation_id.to_string())
        .bind(&entry.source_agent)
        .bind(&entry.target_agent)
        .bind(&entry.message_type)
        .bind(if entry.success { 1 } else { 0 })
        .bind(entry.execution_time_ms as i64)
        .bind(entry.error_message.as_deref())
        .bind(encode_timestamp(&entry.created_at))
        .bind(metadata_json)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to append log entry: {}", e)))?;

        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<CommunicationLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, source_agent, target_agent, message_type, success,
                   execution_time_ms, error_message, created_at, metadata_json
            FROM communication_logs
            WHERE (?1 IS NULL OR correlation_id = ?1)
              AND (?2 IS NULL OR created_at >= ?2)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?3
            "#,
        )
        .bind(query.correlation_id.map(|id| id.to_string()))
        .bind(query.since.as_ref().map(encode_timestamp))
        .bind(query.effective_limit() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to query log entries: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id_str: String = row.get(0);
            let correlation_str: String = row.get(1);
            let success: i64 = row.get(5);
            let execution_time_ms: i64 = row.get(6);
            let created_str: String = row.get(8);
            let metadata_json: String = row.get(9);

            entries.push(CommunicationLogEntry {
                id: uuid::Uuid::parse_str(&id_str)
                    .map_err(|e| Error::storage(format!("Invalid entry ID: {}", e)))?,
                correlation_id: correlation_str
                    .parse()
                    .map_err(|e| Error::storage(format!("Invalid correlation ID: {}", e)))?,
                source_agent: row.get(2),
                target_agent: row.get(3),
                message_type: row.get(4),
                success: success != 0,
                execution_time_ms: execution_time_ms.max(0) as u64,
                error_message: row.get(7),
                created_at: DateTime::parse_from_rfc3339(&created_str)
                    .map_err(|e| Error::storage(format!("Invalid timestamp: {}", e)))?
                    .with_timezone(&Utc),
                metadata: serde_json::from_str(&metadata_json)
                    .map_err(|e| Error::storage(format!("Invalid metadata JSON: {}", e)))?,
            });
        }

        Ok(entries)
    }
}
