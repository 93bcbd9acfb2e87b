//! Orchestrator - process-lifetime owner of every orchestration component
//!
//! The orchestrator wires the registry, protocol, workflow engine, recovery
//! coordinator, fan-out executor and communication log together and exposes
//! the operations callers use. Execution operations never return a raw
//! error: failures come back as results with `success == false` and a
//! readable message.
//!
//! # Example
//!
//! ```rust,ignore
//! use nl2sql_orchestrator::prelude::*;
//!
//! let orchestrator = OrchestratorBuilder::new()
//!     .agent(Arc::new(MyUnderstandingAgent::new()))
//!     .agent(Arc::new(MySqlAgent::new()))
//!     .build()
//!     .await?;
//!
//! let result = orchestrator
//!     .process_query("revenue by month for 2024", &orchestrator.new_context())
//!     .await;
//! ```

use crate::agent::{
    Agent, AgentCapability, AgentEvent, AgentOperation, AgentRequest, ExecuteSql, GenerateSql,
    NavigateSchema, UnderstandQuery, Visualize,
};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::log::{CommunicationLog, InMemoryCommunicationLog};
use crate::metrics::OrchestrationMetrics;
use crate::parallel::{AggregatedResponse, ParallelExecutor};
use crate::protocol::CommunicationProtocol;
use crate::recovery::{RecoveryCoordinator, RecoveryHandler, RecoveryResult, WorkflowFailure};
use crate::registry::{AgentFactory, CapabilityRegistry};
use crate::types::{AgentContext, CorrelationId, WorkflowId};
use crate::workflow::{ExecutionStatus, WorkflowDefinition, WorkflowEngine, WorkflowResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Agent name the orchestrator uses as message source
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

/// SQL produced by the generation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSql {
    /// Statement to execute
    pub sql: String,
    /// Optional explanation of the statement
    #[serde(default)]
    pub explanation: Option<String>,
}

/// Result set produced by the execution stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecution {
    /// Column names
    pub columns: Vec<String>,
    /// Rows
    #[serde(default)]
    pub rows: Vec<Value>,
}

/// Outcome of one pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Stage name
    pub stage: String,
    /// Agent that served the stage
    pub agent_type: String,
    /// Whether the stage succeeded
    pub success: bool,
    /// Elapsed time in milliseconds
    pub execution_time_ms: u64,
    /// Error message
    pub error: Option<String>,
}

/// Structured result of a query run through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    /// Correlation id of every message sent for the query
    pub correlation_id: CorrelationId,
    /// Whether every required stage succeeded
    pub success: bool,
    /// Final output
    pub output: Option<Value>,
    /// Human-readable error
    pub error: Option<String>,
    /// Total execution time
    pub execution_time_ms: u64,
    /// Stages in execution order
    pub stages: Vec<StageOutcome>,
    /// Additional data
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl OrchestrationResult {
    fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            success: false,
            output: None,
            error: None,
            execution_time_ms: 0,
            stages: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    fn failed(mut self, error: impl Into<String>, start: Instant) -> Self {
        self.success = false;
        self.output = None;
        self.error = Some(error.into());
        self.with_time(start)
    }

    fn with_time(mut self, start: Instant) -> Self {
        self.execution_time_ms = start.elapsed().as_millis() as u64;
        self
    }

    /// Outcome of a named stage
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|stage| stage.stage == name)
    }
}

/// A workflow run plus the recovery that followed it, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Final result: the recovered run when recovery succeeded
    pub result: WorkflowResult,
    /// Recovery attempts made after the first run failed
    pub recovery: Option<RecoveryResult>,
}

impl WorkflowExecution {
    /// Whether the workflow ultimately succeeded
    pub fn success(&self) -> bool {
        self.result.success
    }
}

/// Multi-agent orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    protocol: Arc<CommunicationProtocol>,
    engine: Arc<WorkflowEngine>,
    recovery: RecoveryCoordinator,
    parallel: ParallelExecutor,
    log: Arc<dyn CommunicationLog>,
}

impl Orchestrator {
    /// Start building an orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Fresh context for a new logical request
    pub fn new_context(&self) -> AgentContext {
        AgentContext::new(ORCHESTRATOR_AGENT)
    }

    /// Configuration in use
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The capability registry
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// The communication protocol
    pub fn protocol(&self) -> &Arc<CommunicationProtocol> {
        &self.protocol
    }

    /// The workflow engine
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// The communication log
    pub fn log(&self) -> &Arc<dyn CommunicationLog> {
        &self.log
    }

    /// Register an agent
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        self.registry.register(agent).await
    }

    /// Unregister an agent; returns whether it was registered
    pub async fn unregister_agent(&self, agent_type: &str) -> bool {
        self.registry.unregister(agent_type).await
    }

    /// Register a static fallback constructor for an agent type
    pub fn register_fallback(&self, agent_type: impl Into<String>, factory: AgentFactory) {
        self.registry.register_factory(agent_type, factory);
    }

    /// Health-check every agent and return the available descriptors
    pub async fn discover_capabilities(&self) -> Vec<AgentCapability> {
        self.registry.discover_capabilities().await
    }

    /// Answer a natural-language question through the reporting pipeline.
    ///
    /// Understanding, schema navigation, SQL generation and SQL execution
    /// are required; visualization is optional and its failure only adds a
    /// `visualization_error` entry to the metadata.
    pub async fn process_query(&self, query: &str, context: &AgentContext) -> OrchestrationResult {
        let start = Instant::now();
        let pipeline = &self.config.pipeline;
        let mut result = OrchestrationResult::new(context.correlation_id);

        let query = query.trim();
        if query.is_empty() {
            return result.failed(Error::invalid_input("query must not be empty").to_string(), start);
        }

        tracing::info!(correlation_id = %context.correlation_id, "Processing query");

        let understanding: Value = match self
            .run_stage(
                "query_understanding",
                &pipeline.query_understanding,
                AgentOperation::UnderstandQuery(UnderstandQuery {
                    query: query.to_string(),
                }),
                context,
                &mut result,
            )
            .await
        {
            Ok(value) => value,
            Err(e) => return result.failed(e, start),
        };

        let schema: Value = match self
            .run_stage(
                "schema_navigation",
                &pipeline.schema_navigation,
                AgentOperation::NavigateSchema(NavigateSchema {
                    query: query.to_string(),
                    understanding: understanding.clone(),
                }),
                context,
                &mut result,
            )
            .await
        {
            Ok(value) => value,
            Err(e) => return result.failed(e, start),
        };

        let generated: GeneratedSql = match self
            .run_stage(
                "sql_generation",
                &pipeline.sql_generation,
                AgentOperation::GenerateSql(GenerateSql {
                    query: query.to_string(),
                    understanding,
                    schema,
                }),
                context,
                &mut result,
            )
            .await
        {
            Ok(value) => value,
            Err(e) => return result.failed(e, start),
        };

        let execution: QueryExecution = match self
            .run_stage(
                "sql_execution",
                &pipeline.sql_execution,
                AgentOperation::ExecuteSql(ExecuteSql {
                    sql: generated.sql.clone(),
                    max_rows: pipeline.max_rows,
                }),
                context,
                &mut result,
            )
            .await
        {
            Ok(value) => value,
            Err(e) => return result.failed(e, start),
        };

        let mut output = json!({
            "query": query,
            "sql": generated.sql,
            "explanation": generated.explanation,
            "columns": &execution.columns,
            "rows": &execution.rows,
            "row_count": execution.rows.len(),
        });

        if let Some(visualization_agent) = &pipeline.visualization {
            let chart: std::result::Result<Value, String> = self
                .run_stage(
                    "visualization",
                    visualization_agent,
                    AgentOperation::Visualize(Visualize {
                        query: query.to_string(),
                        columns: execution.columns.clone(),
                        rows: execution.rows.clone(),
                    }),
                    context,
                    &mut result,
                )
                .await;

            match chart {
                Ok(chart) => output["visualization"] = chart,
                Err(e) => {
                    tracing::warn!("Visualization skipped: {}", e);
                    result.metadata.insert("visualization_error".to_string(), json!(e));
                }
            }
        }

        result.success = true;
        result.output = Some(output);
        let result = result.with_time(start);
        tracing::info!(
            correlation_id = %context.correlation_id,
            duration_ms = result.execution_time_ms,
            "Query processed"
        );
        result
    }

    async fn run_stage<T: DeserializeOwned>(
        &self,
        stage: &str,
        agent_type: &str,
        operation: AgentOperation,
        context: &AgentContext,
        result: &mut OrchestrationResult,
    ) -> std::result::Result<T, String> {
        let outcome = self
            .protocol
            .send_typed::<T>(agent_type, AgentRequest::new(operation), context, None)
            .await;

        let (value, execution_time_ms) = match outcome {
            Ok(response) => {
                let time = response.execution_time_ms;
                match (response.success, response.result) {
                    (true, Some(value)) => (Ok(value), time),
                    (_, _) => (
                        Err(response
                            .error
                            .unwrap_or_else(|| "agent returned no result".to_string())),
                        time,
                    ),
                }
            }
            Err(e) => (Err(e.to_string()), 0),
        };

        result.stages.push(StageOutcome {
            stage: stage.to_string(),
            agent_type: agent_type.to_string(),
            success: value.is_ok(),
            execution_time_ms,
            error: value.as_ref().err().cloned(),
        });

        value.map_err(|e| format!("{} stage failed: {}", stage, e))
    }

    /// Execute a workflow: optimize it when configured, run it and try
    /// recovery if it aborts
    pub async fn execute_workflow(&self, workflow: &WorkflowDefinition, context: &AgentContext) -> WorkflowExecution {
        let workflow = if self.config.workflow.optimize {
            match self.engine.optimize_workflow(workflow) {
                Ok(optimized) => optimized,
                Err(e) => {
                    tracing::warn!("Workflow {} rejected: {}", workflow.name, e);
                    let mut result = WorkflowResult::start(workflow);
                    result.abort(e.to_string());
                    return WorkflowExecution {
                        result: result.finish(),
                        recovery: None,
                    };
                }
            }
        } else {
            workflow.clone()
        };

        let result = self.engine.coordinate_agents(&workflow, context).await;
        if result.success || !self.config.workflow.recover_failures || result.steps.is_empty() {
            return WorkflowExecution {
                result,
                recovery: None,
            };
        }

        let failure = WorkflowFailure::new(workflow, result.clone());
        let recovery = self.recovery.handle_failure(&failure, context).await;

        let final_result = match recovery.clone().into_result() {
            Ok(recovered) => recovered,
            Err(e) => {
                let mut result = result;
                result.error = Some(e.to_string());
                result
            }
        };

        WorkflowExecution {
            result: final_result,
            recovery: Some(recovery),
        }
    }

    /// Send the same request to several agents concurrently and aggregate
    pub async fn execute_parallel(
        &self,
        agent_types: &[String],
        request: &AgentRequest,
        context: &AgentContext,
    ) -> AggregatedResponse {
        let results = self
            .parallel
            .execute_in_parallel(agent_types, request, context)
            .await;
        self.parallel.aggregate_results(&results, context)
    }

    /// Deliver an event to every other agent, or to `targets`
    pub async fn broadcast(&self, event: AgentEvent, context: &AgentContext, targets: Option<&[String]>) {
        self.protocol.broadcast(event, context, targets).await
    }

    /// Live status of a workflow
    pub async fn monitor_execution(&self, workflow_id: WorkflowId) -> Result<ExecutionStatus> {
        self.engine.monitor_execution(workflow_id).await
    }

    /// Metrics over the whole log, or one correlation id
    pub async fn metrics(&self, correlation_id: Option<CorrelationId>) -> Result<OrchestrationMetrics> {
        OrchestrationMetrics::collect(self.log.as_ref(), correlation_id).await
    }

    /// Unregister every agent, running their shutdown hooks
    pub async fn shutdown(&self) {
        tracing::info!(agents = self.registry.len(), "Shutting down orchestrator");
        self.registry.shutdown().await;
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    log: Option<Arc<dyn CommunicationLog>>,
    agents: Vec<Arc<dyn Agent>>,
    factories: Vec<(String, AgentFactory)>,
    recovery_handlers: Vec<Arc<dyn RecoveryHandler>>,
}

impl OrchestratorBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            log: None,
            agents: Vec::new(),
            factories: Vec::new(),
            recovery_handlers: Vec::new(),
        }
    }

    /// Create a builder configured from the environment
    pub fn from_env() -> Result<Self> {
        Ok(Self::new().config(OrchestratorConfig::from_env()?))
    }

    /// Set configuration
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an explicit communication log instead of the configured one
    pub fn log(mut self, log: Arc<dyn CommunicationLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Add an agent
    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Add multiple agents
    pub fn agents(mut self, agents: Vec<Arc<dyn Agent>>) -> Self {
        self.agents.extend(agents);
        self
    }

    /// Add a static fallback constructor
    pub fn fallback(mut self, agent_type: impl Into<String>, factory: AgentFactory) -> Self {
        self.factories.push((agent_type.into(), factory));
        self
    }

    /// Override a built-in recovery handler
    pub fn recovery_handler(mut self, handler: Arc<dyn RecoveryHandler>) -> Self {
        self.recovery_handlers.push(handler);
        self
    }

    /// Build the orchestrator and register the agents
    pub async fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let log = match self.log {
            Some(log) => log,
            None => open_log(&self.config).await?,
        };

        let registry = Arc::new(CapabilityRegistry::new(
            self.config.registry.clone(),
            self.config.protocol.health_check_timeout(),
        ));
        for (agent_type, factory) in self.factories {
            registry.register_factory(agent_type, factory);
        }

        let protocol = Arc::new(CommunicationProtocol::new(
            registry.clone(),
            log.clone(),
            self.config.protocol.clone(),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            protocol.clone(),
            self.config.workflow.step_timeout(),
        ));

        let mut recovery =
            RecoveryCoordinator::with_engine(engine.clone(), self.config.workflow.fallback_agents.clone());
        for handler in self.recovery_handlers {
            recovery = recovery.with_handler(handler);
        }

        let orchestrator = Orchestrator {
            parallel: ParallelExecutor::new(protocol.clone()),
            config: self.config,
            registry,
            protocol,
            engine,
            recovery,
            log,
        };

        for agent in self.agents {
            orchestrator.register_agent(agent).await?;
        }

        Ok(orchestrator)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "storage")]
async fn open_log(config: &OrchestratorConfig) -> Result<Arc<dyn CommunicationLog>> {
    match &config.storage.database_url {
        Some(url) => Ok(Arc::new(crate::storage::SqliteCommunicationLog::new(url).await?)),
        None => Ok(Arc::new(InMemoryCommunicationLog::new())),
    }
}

#[cfg(not(feature = "storage"))]
async fn open_log(config: &OrchestratorConfig) -> Result<Arc<dyn CommunicationLog>> {
    if config.storage.database_url.is_some() {
        return Err(Error::config(
            "storage.database_url is set but the `storage` feature is disabled",
        ));
    }
    Ok(Arc::new(InMemoryCommunicationLog::new()))
}
