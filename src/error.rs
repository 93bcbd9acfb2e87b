//! Error types for the orchestration layer

use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestration layer
#[derive(Debug, Error)]
pub enum Error {
    /// Target agent is neither registered nor resolvable through a static fallback
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// An attempt exceeded its deadline
    #[error("Agent {agent} timed out after {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    /// The circuit breaker for the target is open
    #[error("Circuit open for agent {0}")]
    CircuitOpen(String),

    /// The agent's payload could not be decoded into the expected response type
    #[error("Response type mismatch from {agent}: expected {expected}: {message}")]
    ResponseTypeMismatch {
        agent: String,
        expected: String,
        message: String,
    },

    /// A required workflow step failed
    #[error("Required step '{step}' failed: {message}")]
    RequiredStepFailed { step: String, message: String },

    /// Every recovery strategy failed
    #[error("Recovery exhausted for workflow {workflow}: {message}")]
    RecoveryExhausted { workflow: String, message: String },

    /// Workflow dependency graph contains a cycle
    #[error("Cyclic workflow: {0}")]
    CyclicWorkflow(String),

    /// Error raised by an agent while processing a request
    #[error("Agent error: {0}")]
    Agent(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Tracing error
    #[error("Tracing error: {0}")]
    Tracing(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an agent error
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create an agent-unavailable error
    pub fn agent_unavailable(agent: impl Into<String>) -> Self {
        Self::AgentUnavailable(agent.into())
    }

    /// Create a timeout error
    pub fn timeout(agent: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            agent: agent.into(),
            timeout,
        }
    }

    /// Create a required-step error
    pub fn required_step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RequiredStepFailed {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
