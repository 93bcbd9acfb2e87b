//! Configuration for the orchestrator and its components
//!
//! Every section has serde defaults, so a YAML file only needs the keys it
//! overrides. Durations are written in milliseconds (or seconds where noted)
//! and exposed as [`Duration`] through accessor methods.

use crate::error::{Error, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming a YAML configuration file
pub const CONFIG_PATH_ENV: &str = "ORCHESTRATOR_CONFIG";

/// Environment variable overriding the communication log database URL
pub const DATABASE_URL_ENV: &str = "ORCHESTRATOR_DATABASE_URL";

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Communication protocol settings
    pub protocol: ProtocolConfig,
    /// Capability registry settings
    pub registry: RegistryConfig,
    /// Workflow engine and recovery settings
    pub workflow: WorkflowConfig,
    /// Agent names for the fixed reporting pipeline
    pub pipeline: PipelineConfig,
    /// Communication log storage
    pub storage: StorageConfig,
}

impl OrchestratorConfig {
    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Build configuration from the environment.
    ///
    /// Reads `.env` when present, loads the YAML file named by
    /// `ORCHESTRATOR_CONFIG` (defaults otherwise) and applies
    /// `ORCHESTRATOR_DATABASE_URL` on top.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            config.storage.database_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.protocol.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        let multiplier = self.protocol.retry.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::config("retry.multiplier must be a finite number >= 1.0"));
        }
        if self.protocol.circuit_breaker.failure_threshold == 0 {
            return Err(Error::config(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.protocol.default_timeout_ms == 0 {
            return Err(Error::config("protocol.default_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Communication protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Per-attempt deadline when the caller supplies none
    pub default_timeout_ms: u64,
    /// Retry policy
    pub retry: RetryConfig,
    /// Circuit breaker policy (applied per target agent)
    pub circuit_breaker: CircuitBreakerConfig,
    /// Deadline for a single agent health check during discovery
    pub health_check_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check_timeout_ms: 5_000,
        }
    }
}

impl ProtocolConfig {
    /// Default per-attempt deadline
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Health check deadline
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Retry policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Sleep before the second attempt
    pub initial_backoff_ms: u64,
    /// Growth factor applied to each following backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            multiplier: 2.0,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed attempts that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed
    pub open_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Open duration
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

/// Capability registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Time a cached capability descriptor stays valid, in seconds
    pub capability_ttl_secs: u64,
    /// Opaque settings handed to every agent's `initialize` hook
    pub agent_settings: HashMap<String, serde_json::Value>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capability_ttl_secs: 30 * 60,
            agent_settings: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    /// Capability cache TTL
    pub fn capability_ttl(&self) -> Duration {
        Duration::from_secs(self.capability_ttl_secs)
    }
}

/// Workflow engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Deadline for a step that declares none
    pub step_timeout_ms: u64,
    /// Topologically reorder workflows before executing them
    pub optimize: bool,
    /// Run recovery strategies when a workflow aborts
    pub recover_failures: bool,
    /// Agent type -> replacement agent type, used by the fallback strategy
    pub fallback_agents: HashMap<String, String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            optimize: true,
            recover_failures: true,
            fallback_agents: HashMap::new(),
        }
    }
}

impl WorkflowConfig {
    /// Default step deadline
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Agent type names backing each stage of the reporting pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Query understanding stage
    pub query_understanding: String,
    /// Schema navigation stage
    pub schema_navigation: String,
    /// SQL generation stage
    pub sql_generation: String,
    /// SQL execution stage
    pub sql_execution: String,
    /// Optional visualization stage; its failure does not fail the pipeline
    pub visualization: Option<String>,
    /// Row limit passed to the execution stage
    pub max_rows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            query_understanding: "query_understanding".to_string(),
            schema_navigation: "schema_navigation".to_string(),
            sql_generation: "sql_generation".to_string(),
            sql_execution: "sql_execution".to_string(),
            visualization: Some("visualization".to_string()),
            max_rows: 1_000,
        }
    }
}

/// Communication log storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite URL; the log stays in memory when unset
    pub database_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_contract() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.protocol.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.protocol.retry.max_attempts, 3);
        assert_eq!(config.protocol.retry.initial_backoff_ms, 100);
        assert_eq!(config.protocol.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.registry.capability_ttl(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
protocol:
  default_timeout_ms: 5000
  retry:
    max_attempts: 5
workflow:
  optimize: false
  fallback_agents:
    sql_generation: sql_generation_simple
pipeline:
  visualization: null
"#;
        let config = OrchestratorConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.protocol.default_timeout_ms, 5000);
        assert_eq!(config.protocol.retry.max_attempts, 5);
        assert_eq!(config.protocol.retry.initial_backoff_ms, 100);
        assert!(!config.workflow.optimize);
        assert_eq!(
            config.workflow.fallback_agents.get("sql_generation").map(String::as_str),
            Some("sql_generation_simple")
        );
        assert!(config.pipeline.visualization.is_none());
        assert_eq!(config.pipeline.sql_generation, "sql_generation");
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = OrchestratorConfig::default();
        config.protocol.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_non_finite_multiplier() {
        let mut config = OrchestratorConfig::default();
        config.protocol.retry.multiplier = f64::NAN;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.protocol.retry.multiplier = f64::INFINITY;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.yaml");
        std::fs::write(&path, "storage:\n  database_url: \"sqlite::memory:\"\n").unwrap();

        let config = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.database_url.as_deref(), Some("sqlite::memory:"));
    }
}
