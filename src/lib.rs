//! # NL2SQL Orchestrator
//!
//! Coordination layer for a multi-agent natural-language-to-SQL reporting
//! system. Independent agents (query understanding, schema navigation, SQL
//! generation, SQL execution, visualization) are registered with the
//! orchestrator and addressed by name; this crate handles everything
//! between them.
//!
//! ## Features
//!
//! - **Capability Registry**: live agents, cached descriptors, health-checked discovery
//! - **Communication Protocol**: typed request/response with deadlines, retry with
//!   backoff, per-target circuit breakers and broadcast
//! - **Workflows**: required/optional steps, dependency ordering with cycle detection,
//!   status derived from the log
//! - **Recovery**: retry, fallback and simplify strategies for failed workflows
//! - **Fan-out**: concurrent dispatch with partial-failure aggregation
//! - **Communication Log**: append-only record of every exchange, in memory or SQLite
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nl2sql_orchestrator::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     init_tracing(LogFormat::Pretty)?;
//!
//!     let orchestrator = OrchestratorBuilder::from_env()?
//!         .agent(Arc::new(UnderstandingAgent::default()))
//!         .agent(Arc::new(SqlAgent::default()))
//!         .build()
//!         .await?;
//!
//!     let result = orchestrator
//!         .process_query("top 5 customers by revenue", &orchestrator.new_context())
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod orchestrator;
pub mod parallel;
pub mod protocol;
pub mod recovery;
pub mod registry;
#[cfg(feature = "storage")]
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod workflow;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use agent::{
    Agent, AgentCapability, AgentEvent, AgentOperation, AgentRequest, AgentResponse, HealthStatus,
};
pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use log::{CommunicationLog, CommunicationLogEntry, InMemoryCommunicationLog, LogQuery};
pub use metrics::OrchestrationMetrics;
pub use orchestrator::{
    OrchestrationResult, Orchestrator, OrchestratorBuilder, WorkflowExecution,
};
pub use parallel::{AggregatedResponse, ParallelExecutor};
pub use protocol::{CircuitState, CommunicationProtocol};
pub use recovery::{RecoveryCoordinator, RecoveryHandler, RecoveryResult, RecoveryStrategy};
pub use registry::CapabilityRegistry;
#[cfg(feature = "storage")]
pub use storage::SqliteCommunicationLog;
pub use telemetry::{init_tracing, LogFormat};
pub use types::{AgentContext, CorrelationId, RequestId, UserId, WorkflowId};
pub use workflow::{
    ExecutionState, ExecutionStatus, WorkflowDefinition, WorkflowEngine, WorkflowResult,
    WorkflowStep,
};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::agent::{
        Agent, AgentCapability, AgentEvent, AgentOperation, AgentRequest, AgentResponse,
        HealthStatus,
    };
    pub use crate::config::OrchestratorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::orchestrator::{Orchestrator, OrchestratorBuilder};
    pub use crate::telemetry::{init_tracing, LogFormat};
    pub use crate::types::AgentContext;
    pub use crate::workflow::{WorkflowDefinition, WorkflowStep};
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}
