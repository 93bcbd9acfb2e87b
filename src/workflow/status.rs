//! Live execution status derived from the communication log

use crate::log::CommunicationLogEntry;
use crate::types::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse state of a workflow as seen in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Nothing logged yet
    NotStarted,
    /// Every logged exchange succeeded
    Completed,
    /// At least one logged exchange failed
    Failed,
}

/// Snapshot of a workflow's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    /// Workflow identifier
    pub workflow_id: WorkflowId,
    /// Derived state
    pub state: ExecutionState,
    /// Estimated progress in `[0.0, 1.0]`
    pub progress: f64,
    /// Logged exchanges
    pub message_count: usize,
    /// Most recent log entry time
    pub last_activity: Option<DateTime<Utc>>,
}

impl ExecutionStatus {
    /// Derive status from the log entries of one workflow.
    ///
    /// With an unknown expected step count, progress is 1.0 as soon as
    /// anything was logged.
    pub fn from_entries(
        workflow_id: WorkflowId,
        entries: &[CommunicationLogEntry],
        expected_steps: usize,
    ) -> Self {
        let state = if entries.is_empty() {
            ExecutionState::NotStarted
        } else if entries.iter().any(|entry| !entry.success) {
            ExecutionState::Failed
        } else {
            ExecutionState::Completed
        };

        let progress = match (entries.len(), expected_steps) {
            (0, _) => 0.0,
            (_, 0) => 1.0,
            (logged, expected) => (logged as f64 / expected as f64).min(1.0),
        };

        Self {
            workflow_id,
            state,
            progress,
            message_count: entries.len(),
            last_activity: entries.iter().map(|entry| entry.created_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::entry;

    #[test]
    fn test_status_from_entries() {
        let id = WorkflowId::new();
        let correlation = id.into();

        let none = ExecutionStatus::from_entries(id, &[], 2);
        assert_eq!(none.state, ExecutionState::NotStarted);
        assert_eq!(none.progress, 0.0);
        assert!(none.last_activity.is_none());

        let mixed = vec![entry(correlation, "a", true, 1), entry(correlation, "b", false, 1)];
        assert_eq!(
            ExecutionStatus::from_entries(id, &mixed, 4).state,
            ExecutionState::Failed
        );

        let done = vec![entry(correlation, "a", true, 1), entry(correlation, "b", true, 1)];
        let status = ExecutionStatus::from_entries(id, &done, 2);
        assert_eq!(status.state, ExecutionState::Completed);
        assert_eq!(status.progress, 1.0);
        assert_eq!(status.message_count, 2);
    }

    #[test]
    fn test_progress_is_capped() {
        let id = WorkflowId::new();
        let retried: Vec<_> = (0..5).map(|_| entry(id.into(), "a", true, 1)).collect();
        assert_eq!(ExecutionStatus::from_entries(id, &retried, 2).progress, 1.0);
        assert_eq!(ExecutionStatus::from_entries(id, &retried[..1], 4).progress, 0.25);
    }
}
