//! Agent contract and the typed request/response messages exchanged with agents

use crate::error::Result;
use crate::types::{AgentContext, RequestId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Contract every independently addressable agent implements.
///
/// `process` reports domain failures as a response with `success == false`.
/// An `Err` return means the call itself failed and is treated by the
/// protocol as a failed attempt (retried, counted by the circuit breaker).
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique agent type name used for addressing
    fn agent_type(&self) -> &str;

    /// Capability descriptor advertised to the registry
    fn capabilities(&self) -> AgentCapability;

    /// Handle a request
    async fn process(&self, request: AgentRequest, context: &AgentContext) -> Result<AgentResponse>;

    /// Cheap liveness/readiness probe
    async fn health_status(&self) -> Result<HealthStatus>;

    /// Called once when the agent is registered
    async fn initialize(&self, _settings: &HashMap<String, serde_json::Value>) -> Result<()> {
        Ok(())
    }

    /// Called once when the agent is unregistered
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Health probe result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the agent can serve requests
    pub is_healthy: bool,
    /// Short status label
    pub status: String,
    /// Known problems
    pub issues: Vec<String>,
}

impl HealthStatus {
    /// A healthy status
    pub fn healthy() -> Self {
        Self {
            is_healthy: true,
            status: "healthy".to_string(),
            issues: Vec::new(),
        }
    }

    /// An unhealthy status with the given issues
    pub fn unhealthy(issues: Vec<String>) -> Self {
        Self {
            is_healthy: false,
            status: "unhealthy".to_string(),
            issues,
        }
    }
}

/// Capability descriptor of an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    /// Agent type name (unique key)
    pub agent_type: String,
    /// Names of supported operations, see [`AgentOperation::name`]
    pub operations: Vec<String>,
    /// Free-form metadata (version, specialization, concurrency limits)
    pub metadata: HashMap<String, serde_json::Value>,
    /// Relative performance score
    pub performance_score: f64,
    /// Whether the last health check passed
    pub is_available: bool,
    /// When the last health check ran
    pub last_health_check: DateTime<Utc>,
}

impl AgentCapability {
    /// Create a descriptor for the given agent type
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            operations: Vec::new(),
            metadata: HashMap::new(),
            performance_score: 1.0,
            is_available: true,
            last_health_check: Utc::now(),
        }
    }

    /// Add a supported operation
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operations.push(operation.into());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the performance score
    pub fn with_performance_score(mut self, score: f64) -> Self {
        self.performance_score = score;
        self
    }

    /// Whether the agent advertises the operation
    pub fn supports(&self, operation: &str) -> bool {
        self.operations.iter().any(|op| op == operation)
    }
}

/// Input of the query understanding stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderstandQuery {
    /// Natural-language question
    pub query: String,
}

/// Input of the schema navigation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigateSchema {
    /// Natural-language question
    pub query: String,
    /// Output of the understanding stage
    #[serde(default)]
    pub understanding: serde_json::Value,
}

/// Input of the SQL generation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateSql {
    /// Natural-language question
    pub query: String,
    /// Output of the understanding stage
    #[serde(default)]
    pub understanding: serde_json::Value,
    /// Relevant schema selected by the navigation stage
    #[serde(default)]
    pub schema: serde_json::Value,
}

/// Input of the SQL execution stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteSql {
    /// Statement to run
    pub sql: String,
    /// Maximum rows to return
    pub max_rows: usize,
}

/// Input of the visualization stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visualize {
    /// Natural-language question
    pub query: String,
    /// Columns of the result set
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<serde_json::Value>,
}

/// Event delivered by broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Event name
    pub name: String,
    /// Event data
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentEvent {
    /// Create an event
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Closed set of operations an agent can be asked to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "input", rename_all = "snake_case")]
pub enum AgentOperation {
    /// Extract intent and entities from a question
    UnderstandQuery(UnderstandQuery),
    /// Select relevant tables and columns
    NavigateSchema(NavigateSchema),
    /// Produce SQL
    GenerateSql(GenerateSql),
    /// Run SQL
    ExecuteSql(ExecuteSql),
    /// Choose and build a chart
    Visualize(Visualize),
    /// Fire-and-forget notification
    Notify(AgentEvent),
}

impl AgentOperation {
    /// Stable operation tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnderstandQuery(_) => "understand_query",
            Self::NavigateSchema(_) => "navigate_schema",
            Self::GenerateSql(_) => "generate_sql",
            Self::ExecuteSql(_) => "execute_sql",
            Self::Visualize(_) => "visualize",
            Self::Notify(_) => "notify",
        }
    }
}

/// Request sent to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Request identifier, echoed by the response
    pub id: RequestId,
    /// Operation and its typed payload
    pub operation: AgentOperation,
    /// Additional parameters
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl AgentRequest {
    /// Create a request for an operation
    pub fn new(operation: AgentOperation) -> Self {
        Self {
            id: RequestId::new(),
            operation,
            parameters: HashMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Response from an agent, parameterized by the result type expected at the call site.
///
/// Exactly one of `result` / `error` is present: `result` when `success`,
/// `error` otherwise. Use [`AgentResponse::success`] and
/// [`AgentResponse::failure`] to keep it that way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse<T = serde_json::Value> {
    /// Id of the request this answers
    pub request_id: RequestId,
    /// Whether the operation succeeded
    pub success: bool,
    /// Result payload
    pub result: Option<T>,
    /// Error message
    pub error: Option<String>,
    /// Elapsed time in milliseconds
    pub execution_time_ms: u64,
    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl<T> AgentResponse<T> {
    /// Successful response
    pub fn success(request_id: RequestId, result: T) -> Self {
        Self {
            request_id,
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Failed response
    pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Set the execution time
    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the result/error pairing holds
    pub fn is_consistent(&self) -> bool {
        if self.success {
            self.result.is_some() && self.error.is_none()
        } else {
            self.result.is_none() && self.error.is_some()
        }
    }
}

impl AgentResponse<serde_json::Value> {
    /// Decode the payload into the type expected by the caller
    pub fn into_typed<U: DeserializeOwned>(self) -> std::result::Result<AgentResponse<U>, serde_json::Error> {
        let result = match self.result {
            Some(value) => Some(serde_json::from_value(value)?),
            None if self.success => Some(serde_json::from_value(serde_json::Value::Null)?),
            None => None,
        };

        Ok(AgentResponse {
            request_id: self.request_id,
            success: self.success,
            result,
            error: self.error,
            execution_time_ms: self.execution_time_ms,
            metadata: self.metadata,
        })
    }
}
