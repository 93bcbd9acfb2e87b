//! Orchestration metrics derived on demand from the communication log

use crate::error::Result;
use crate::log::{CommunicationLog, CommunicationLogEntry, LogQuery};
use crate::types::CorrelationId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Aggregate view over logged exchanges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationMetrics {
    /// Number of exchanges considered
    pub message_count: usize,
    /// Sum of logged durations
    pub total_execution_time_ms: u64,
    /// Distinct target agents, sorted
    pub agents_involved: Vec<String>,
    /// Cumulative duration per target agent
    pub agent_execution_times: BTreeMap<String, u64>,
    /// Fraction of successful exchanges; 0.0 when nothing was logged
    pub success_rate: f64,
    /// Distinct error messages, sorted
    pub errors: Vec<String>,
}

impl OrchestrationMetrics {
    /// Compute metrics over a set of entries
    pub fn from_entries(entries: &[CommunicationLogEntry]) -> Self {
        let mut agent_execution_times = BTreeMap::new();
        let mut errors = BTreeSet::new();
        let mut total_execution_time_ms = 0u64;
        let mut successes = 0usize;

        for entry in entries {
            total_execution_time_ms += entry.execution_time_ms;
            *agent_execution_times
                .entry(entry.target_agent.clone())
                .or_insert(0u64) += entry.execution_time_ms;

            if entry.success {
                successes += 1;
            }
            if let Some(error) = &entry.error_message {
                errors.insert(error.clone());
            }
        }

        let success_rate = if entries.is_empty() {
            0.0
        } else {
            successes as f64 / entries.len() as f64
        };

        Self {
            message_count: entries.len(),
            total_execution_time_ms,
            agents_involved: agent_execution_times.keys().cloned().collect(),
            agent_execution_times,
            success_rate,
            errors: errors.into_iter().collect(),
        }
    }

    /// Read the log (optionally for one correlation id) and compute metrics
    pub async fn collect(
        log: &dyn CommunicationLog,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Self> {
        let query = LogQuery {
            correlation_id,
            ..LogQuery::default()
        };
        let entries = log.query(&query).await?;
        Ok(Self::from_entries(&entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{entry, InMemoryCommunicationLog};

    #[test]
    fn test_metrics_from_entries() {
        let id = CorrelationId::new();
        let entries = vec![
            entry(id, "sql_generation", true, 40),
            entry(id, "sql_generation", false, 10),
            entry(id, "sql_execution", true, 25),
            entry(id, "sql_execution", false, 5),
        ];

        let metrics = OrchestrationMetrics::from_entries(&entries);
        assert_eq!(metrics.message_count, 4);
        assert_eq!(metrics.total_execution_time_ms, 80);
        assert_eq!(metrics.agents_involved, vec!["sql_execution", "sql_generation"]);
        assert_eq!(metrics.agent_execution_times["sql_generation"], 50);
        assert!((metrics.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            metrics.errors,
            vec!["sql_execution failed".to_string(), "sql_generation failed".to_string()]
        );
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = OrchestrationMetrics::from_entries(&[]);
        assert_eq!(metrics.message_count, 0);
        assert_eq!(metrics.success_rate, 0.0);
        assert!(metrics.agents_involved.is_empty());
    }

    #[tokio::test]
    async fn test_collect_filters_by_correlation() {
        let log = InMemoryCommunicationLog::new();
        let wanted = CorrelationId::new();
        log.append(&entry(wanted, "a", true, 3)).await.unwrap();
        log.append(&entry(CorrelationId::new(), "b", true, 4)).await.unwrap();

        let scoped = OrchestrationMetrics::collect(&log, Some(wanted)).await.unwrap();
        assert_eq!(scoped.agents_involved, vec!["a"]);

        let all = OrchestrationMetrics::collect(&log, None).await.unwrap();
        assert_eq!(all.total_execution_time_ms, 7);
    }
}
