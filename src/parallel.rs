//! Parallel fan-out - the same request to several agents, aggregated afterwards
//!
//! All agents run concurrently, with results aggregated once every branch
//! finished. A failing branch becomes a failed response for its agent and
//! never cancels the others.

use crate::agent::{AgentRequest, AgentResponse};
use crate::protocol::CommunicationProtocol;
use crate::types::{AgentContext, CorrelationId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

/// Aggregate of a fan-out.
///
/// Unlike a single [`AgentResponse`], a successful aggregate may still carry
/// an error naming the agents that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResponse {
    /// Correlation id of the fan-out
    pub correlation_id: CorrelationId,
    /// Whether at least one agent succeeded
    pub success: bool,
    /// Results of the agents that succeeded
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Agents that failed, sorted
    pub failed_agents: Vec<String>,
    /// Names the failed agents and their errors
    pub error: Option<String>,
    /// Sum of individual execution times
    pub total_execution_time_ms: u64,
}

/// Fan-out executor over the communication protocol
pub struct ParallelExecutor {
    protocol: Arc<CommunicationProtocol>,
}

impl ParallelExecutor {
    /// Create an executor
    pub fn new(protocol: Arc<CommunicationProtocol>) -> Self {
        Self { protocol }
    }

    /// Send `request` to every listed agent concurrently.
    ///
    /// The map has exactly one entry per distinct agent type.
    pub async fn execute_in_parallel(
        &self,
        agent_types: &[String],
        request: &AgentRequest,
        context: &AgentContext,
    ) -> HashMap<String, AgentResponse> {
        let mut seen = HashSet::new();
        let targets: Vec<&String> = agent_types
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .collect();

        tracing::debug!(
            operation = request.operation.name(),
            agents = targets.len(),
            "Fanning out request"
        );

        let futures: Vec<_> = targets
            .into_iter()
            .map(|agent_type| async move {
                let start = Instant::now();
                let response = match self
                    .protocol
                    .send(agent_type, request.clone(), context, None)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!("Agent {} failed: {}", agent_type, e);
                        AgentResponse::failure(request.id, e.to_string())
                            .with_execution_time(start.elapsed().as_millis() as u64)
                    }
                };
                (agent_type.clone(), response)
            })
            .collect();

        join_all(futures).await.into_iter().collect()
    }

    /// Combine fan-out responses.
    ///
    /// Execution time is the sum over agents, not wall-clock time.
    pub fn aggregate_results(
        &self,
        results: &HashMap<String, AgentResponse>,
        context: &AgentContext,
    ) -> AggregatedResponse {
        let mut outputs = BTreeMap::new();
        let mut failures = BTreeMap::new();
        let mut total_execution_time_ms = 0u64;

        for (agent, response) in results {
            total_execution_time_ms += response.execution_time_ms;
            if response.success {
                outputs.insert(
                    agent.clone(),
                    response.result.clone().unwrap_or(serde_json::Value::Null),
                );
            } else {
                failures.insert(
                    agent.clone(),
                    response.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                );
            }
        }

        let error = if failures.is_empty() {
            None
        } else {
            let details: Vec<String> = failures
                .iter()
                .map(|(agent, error)| format!("{}: {}", agent, error))
                .collect();
            Some(format!("Failed agents: {}", details.join("; ")))
        };

        AggregatedResponse {
            correlation_id: context.correlation_id,
            success: !outputs.is_empty(),
            outputs,
            failed_agents: failures.into_keys().collect(),
            error,
            total_execution_time_ms,
        }
    }
}
