//! Append-only communication log
//!
//! Every completed or failed exchange produces exactly one entry. Entries are
//! never updated after they are written; the log is the only durable state
//! of the orchestration layer and everything observable (execution status,
//! metrics) is derived from it.

use crate::error::Result;
use crate::types::CorrelationId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard cap on rows returned by a single query
pub const MAX_QUERY_ROWS: usize = 1000;

/// One logged exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationLogEntry {
    /// Entry identifier
    pub id: Uuid,
    /// Correlation id of the exchange
    pub correlation_id: CorrelationId,
    /// Sending agent
    pub source_agent: String,
    /// Receiving agent
    pub target_agent: String,
    /// Operation name of the request
    pub message_type: String,
    /// Whether the exchange succeeded
    pub success: bool,
    /// Elapsed time in milliseconds
    pub execution_time_ms: u64,
    /// Error message of a failed exchange
    pub error_message: Option<String>,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Free-form metadata
    pub metadata: serde_json::Value,
}

/// Filter for reading the log
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    /// Only entries with this correlation id
    pub correlation_id: Option<CorrelationId>,
    /// Only entries created at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows, clamped to [`MAX_QUERY_ROWS`]
    pub limit: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            correlation_id: None,
            since: None,
            limit: MAX_QUERY_ROWS,
        }
    }
}

impl LogQuery {
    /// Query everything (up to the cap)
    pub fn all() -> Self {
        Self::default()
    }

    /// Query one correlation id
    pub fn for_correlation(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::default()
        }
    }

    /// Only entries created at or after `since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Set the row limit
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Row limit after applying the cap
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_QUERY_ROWS)
    }

    /// Whether an entry passes the filters
    pub fn matches(&self, entry: &CommunicationLogEntry) -> bool {
        self.correlation_id
            .map_or(true, |id| entry.correlation_id == id)
            && self.since.map_or(true, |since| entry.created_at >= since)
    }
}

/// Storage for communication log entries
#[async_trait]
pub trait CommunicationLog: Send + Sync {
    /// Append an entry
    async fn append(&self, entry: &CommunicationLogEntry) -> Result<()>;

    /// Read entries newest first
    async fn query(&self, query: &LogQuery) -> Result<Vec<CommunicationLogEntry>>;
}

/// Process-local log
#[derive(Default)]
pub struct InMemoryCommunicationLog {
    entries: RwLock<Vec<CommunicationLogEntry>>,
}

impl InMemoryCommunicationLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CommunicationLog for InMemoryCommunicationLog {
    async fn append(&self, entry: &CommunicationLogEntry) -> Result<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<CommunicationLogEntry>> {
        let entries = self.entries.read();
        let mut matched: Vec<CommunicationLogEntry> = entries
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();

        // stable: equal timestamps keep newest-appended first
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(query.effective_limit());
        Ok(matched)
    }
}

#[cfg(test)]
pub(crate) fn entry(correlation_id: CorrelationId, target: &str, success: bool, ms: u64) -> CommunicationLogEntry {
    CommunicationLogEntry {
        id: Uuid::new_v4(),
        correlation_id,
        source_agent: "orchestrator".to_string(),
        target_agent: target.to_string(),
        message_type: "notify".to_string(),
        success,
        execution_time_ms: ms,
        error_message: if success { None } else { Some(format!("{} failed", target)) },
        created_at: Utc::now(),
        metadata: serde_json::json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_query_filters_and_orders_newest_first() {
        let log = InMemoryCommunicationLog::new();
        let wanted = CorrelationId::new();
        let other = CorrelationId::new();

        let mut old = entry(wanted, "a", true, 5);
        old.created_at = Utc::now() - Duration::minutes(10);
        log.append(&old).await.unwrap();
        log.append(&entry(other, "b", true, 5)).await.unwrap();
        let recent = entry(wanted, "c", false, 7);
        log.append(&recent).await.unwrap();

        let rows = log.query(&LogQuery::for_correlation(wanted)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].target_agent, "c");
        assert_eq!(rows[1].target_agent, "a");

        let since = LogQuery::for_correlation(wanted).since(Utc::now() - Duration::minutes(1));
        let rows = log.query(&since).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, recent.id);
    }

    #[tokio::test]
    async fn test_query_is_capped() {
        let log = InMemoryCommunicationLog::new();
        let id = CorrelationId::new();
        for _ in 0..(MAX_QUERY_ROWS + 5) {
            log.append(&entry(id, "a", true, 1)).await.unwrap();
        }

        assert_eq!(log.query(&LogQuery::all().limit(10_000)).await.unwrap().len(), MAX_QUERY_ROWS);
        assert_eq!(log.query(&LogQuery::all().limit(3)).await.unwrap().len(), 3);
    }
}
