//! Failure recovery - ordered strategies tried against a failed workflow
//!
//! The coordinator only sequences and records attempts; what a strategy
//! actually does is up to its [`RecoveryHandler`]. Built-in handlers backed
//! by the [`WorkflowEngine`] cover the three strategies.

use crate::error::{Error, Result};
use crate::types::{AgentContext, WorkflowId};
use crate::workflow::{WorkflowDefinition, WorkflowEngine, WorkflowResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Named recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run the workflow unchanged
    Retry,
    /// Re-target failed steps to fallback agents
    Fallback,
    /// Re-run without optional steps
    Simplify,
}

impl RecoveryStrategy {
    /// Strategies in the order they are tried
    pub const ALL: [RecoveryStrategy; 3] = [Self::Retry, Self::Fallback, Self::Simplify];

    /// Strategy name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::Simplify => "simplify",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed workflow run handed to recovery
#[derive(Debug, Clone)]
pub struct WorkflowFailure {
    /// The workflow as it was executed
    pub workflow: WorkflowDefinition,
    /// The failed result
    pub result: WorkflowResult,
    /// Original error message
    pub error: String,
}

impl WorkflowFailure {
    /// Build from a failed run
    pub fn new(workflow: WorkflowDefinition, result: WorkflowResult) -> Self {
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| format!("workflow '{}' failed", workflow.name));
        Self {
            workflow,
            result,
            error,
        }
    }

    /// Names of the steps that failed
    pub fn failed_steps(&self) -> HashSet<&str> {
        self.result
            .failed_steps()
            .map(|step| step.step_name.as_str())
            .collect()
    }
}

/// One strategy attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// Strategy tried
    pub strategy: RecoveryStrategy,
    /// Whether it recovered the workflow
    pub success: bool,
    /// Elapsed time in milliseconds
    pub duration_ms: u64,
    /// Why it failed
    pub error: Option<String>,
}

/// Outcome of recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// Workflow identifier
    pub workflow_id: WorkflowId,
    /// Whether any strategy succeeded
    pub success: bool,
    /// Strategy that succeeded
    pub strategy: Option<RecoveryStrategy>,
    /// Attempts in the order they ran
    pub attempts: Vec<RecoveryAttempt>,
    /// Result of the successful re-run
    pub recovered: Option<WorkflowResult>,
    /// Error of the original failure
    pub original_error: String,
}

impl RecoveryResult {
    /// Recovered workflow result, or `RecoveryExhausted` carrying the original error
    pub fn into_result(self) -> Result<WorkflowResult> {
        match self.recovered {
            Some(result) if self.success => Ok(result),
            _ => Err(Error::RecoveryExhausted {
                workflow: self.workflow_id.to_string(),
                message: self.original_error,
            }),
        }
    }
}

/// Executes one recovery strategy
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Strategy this handler implements
    fn strategy(&self) -> RecoveryStrategy;

    /// Attempt recovery. A returned result that is not successful counts as a failed attempt.
    async fn recover(&self, failure: &WorkflowFailure, context: &AgentContext) -> Result<WorkflowResult>;
}

/// Tries strategies in order until one succeeds
#[derive(Default)]
pub struct RecoveryCoordinator {
    handlers: HashMap<RecoveryStrategy, Arc<dyn RecoveryHandler>>,
}

impl RecoveryCoordinator {
    /// Coordinator without handlers; every strategy fails until one is registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator with the built-in handlers backed by `engine`
    pub fn with_engine(engine: Arc<WorkflowEngine>, fallback_agents: HashMap<String, String>) -> Self {
        Self::new()
            .with_handler(Arc::new(RetryHandler::new(engine.clone())))
            .with_handler(Arc::new(FallbackHandler::new(engine.clone(), fallback_agents)))
            .with_handler(Arc::new(SimplifyHandler::new(engine)))
    }

    /// Register a handler, replacing any handler for the same strategy
    pub fn with_handler(mut self, handler: Arc<dyn RecoveryHandler>) -> Self {
        self.handlers.insert(handler.strategy(), handler);
        self
    }

    /// Whether a handler exists for the strategy
    pub fn has_handler(&self, strategy: RecoveryStrategy) -> bool {
        self.handlers.contains_key(&strategy)
    }

    /// Try every strategy in order, stopping at the first success
    pub async fn handle_failure(&self, failure: &WorkflowFailure, context: &AgentContext) -> RecoveryResult {
        let mut result = RecoveryResult {
            workflow_id: failure.workflow.id,
            success: false,
            strategy: None,
            attempts: Vec::new(),
            recovered: None,
            original_error: failure.error.clone(),
        };

        for strategy in RecoveryStrategy::ALL {
            let start = Instant::now();
            let outcome = match self.handlers.get(&strategy) {
                Some(handler) => handler.recover(failure, context).await,
                None => Err(Error::other(format!("no handler for {} strategy", strategy))),
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            let (success, error, recovered) = match outcome {
                Ok(run) if run.success => (true, None, Some(run)),
                Ok(run) => (
                    false,
                    Some(run.error.unwrap_or_else(|| "workflow failed again".to_string())),
                    None,
                ),
                Err(e) => (false, Some(e.to_string()), None),
            };

            if let Some(error) = &error {
                tracing::warn!(
                    "Recovery strategy {} failed for workflow {}: {}",
                    strategy,
                    failure.workflow.name,
                    error
                );
            }

            result.attempts.push(RecoveryAttempt {
                strategy,
                success,
                duration_ms,
                error,
            });

            if success {
                tracing::info!(
                    "Workflow {} recovered with {} strategy",
                    failure.workflow.name,
                    strategy
                );
                result.success = true;
                result.strategy = Some(strategy);
                result.recovered = recovered;
                break;
            }
        }

        result
    }
}

/// Re-runs the workflow unchanged
pub struct RetryHandler {
    engine: Arc<WorkflowEngine>,
}

impl RetryHandler {
    /// Create a handler
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RecoveryHandler for RetryHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::Retry
    }

    async fn recover(&self, failure: &WorkflowFailure, context: &AgentContext) -> Result<WorkflowResult> {
        Ok(self.engine.coordinate_agents(&failure.workflow, context).await)
    }
}

/// Re-targets failed steps to configured fallback agents
pub struct FallbackHandler {
    engine: Arc<WorkflowEngine>,
    fallback_agents: HashMap<String, String>,
}

impl FallbackHandler {
    /// Create a handler with an agent type -> fallback agent type map
    pub fn new(engine: Arc<WorkflowEngine>, fallback_agents: HashMap<String, String>) -> Self {
        Self {
            engine,
            fallback_agents,
        }
    }
}

#[async_trait]
impl RecoveryHandler for FallbackHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::Fallback
    }

    async fn recover(&self, failure: &WorkflowFailure, context: &AgentContext) -> Result<WorkflowResult> {
        let failed = failure.failed_steps();
        let mut workflow = failure.workflow.clone();
        let mut replaced = 0;

        for step in workflow.steps.iter_mut().filter(|s| failed.contains(s.name.as_str())) {
            if let Some(fallback) = self.fallback_agents.get(&step.agent_type) {
                tracing::debug!(
                    "Step {} falls back from {} to {}",
                    step.name,
                    step.agent_type,
                    fallback
                );
                step.agent_type = fallback.clone();
                replaced += 1;
            }
        }

        if replaced == 0 {
            return Err(Error::other("no fallback agent configured for the failed steps"));
        }

        Ok(self.engine.coordinate_agents(&workflow, context).await)
    }
}

/// Re-runs the workflow with optional steps removed
pub struct SimplifyHandler {
    engine: Arc<WorkflowEngine>,
}

impl SimplifyHandler {
    /// Create a handler
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RecoveryHandler for SimplifyHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::Simplify
    }

    async fn recover(&self, failure: &WorkflowFailure, context: &AgentContext) -> Result<WorkflowResult> {
        if !failure.workflow.has_optional_steps() {
            return Err(Error::other("workflow has no optional steps to remove"));
        }
        let simplified = failure.workflow.required_only();
        Ok(self.engine.coordinate_agents(&simplified, context).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentEvent, AgentOperation};
    use crate::config::{ProtocolConfig, RetryConfig};
    use crate::test_support::{protocol_with, Behavior, ScriptedAgent};
    use crate::workflow::WorkflowStep;
    use serde_json::json;
    use std::time::Duration;

    fn notify(name: &str) -> AgentOperation {
        AgentOperation::Notify(AgentEvent::new(name, json!({})))
    }

    fn single_attempt() -> ProtocolConfig {
        ProtocolConfig {
            retry: RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
            ..ProtocolConfig::default()
        }
    }

    struct Fixed {
        strategy: RecoveryStrategy,
        succeed: bool,
    }

    #[async_trait]
    impl RecoveryHandler for Fixed {
        fn strategy(&self) -> RecoveryStrategy {
            self.strategy
        }

        async fn recover(&self, failure: &WorkflowFailure, _context: &AgentContext) -> Result<WorkflowResult> {
            if self.succeed {
                Ok(WorkflowResult::start(&failure.workflow).finish())
            } else {
                Err(Error::other(format!("{} did not help", self.strategy)))
            }
        }
    }

    fn failure() -> WorkflowFailure {
        let workflow = WorkflowDefinition::new("report")
            .with_step(WorkflowStep::new("generate", "sql_generation", 0, notify("g")));
        let mut result = WorkflowResult::start(&workflow);
        result.abort("Required step 'generate' failed: model offline");
        WorkflowFailure::new(workflow, result.finish())
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let coordinator = RecoveryCoordinator::new()
            .with_handler(Arc::new(Fixed { strategy: RecoveryStrategy::Retry, succeed: false }))
            .with_handler(Arc::new(Fixed { strategy: RecoveryStrategy::Fallback, succeed: true }))
            .with_handler(Arc::new(Fixed { strategy: RecoveryStrategy::Simplify, succeed: true }));

        let result = coordinator
            .handle_failure(&failure(), &AgentContext::new("orchestrator"))
            .await;

        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::Fallback));
        assert_eq!(result.attempts.len(), 2);
        assert!(!result.attempts[0].success);
        assert!(result.attempts[0].error.as_deref().unwrap().contains("retry"));
        assert!(result.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_exhaustion_preserves_original_error() {
        let coordinator = RecoveryCoordinator::new()
            .with_handler(Arc::new(Fixed { strategy: RecoveryStrategy::Retry, succeed: false }));

        let result = coordinator
            .handle_failure(&failure(), &AgentContext::new("orchestrator"))
            .await;

        assert!(!result.success);
        let strategies: Vec<_> = result.attempts.iter().map(|a| a.strategy).collect();
        assert_eq!(strategies, RecoveryStrategy::ALL.to_vec());
        assert!(result.attempts[1].error.as_deref().unwrap().contains("no handler"));

        match result.into_result() {
            Err(Error::RecoveryExhausted { message, .. }) => {
                assert!(message.contains("model offline"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_handler_recovers_transient_failure() {
        let agent = ScriptedAgent::new("sql_generation")
            .then(Behavior::Raise("model offline".into()))
            .arc();
        let (protocol, _log) = protocol_with(single_attempt(), vec![agent.clone()]).await;
        let engine = Arc::new(WorkflowEngine::new(protocol, Duration::from_secs(5)));
        let coordinator = RecoveryCoordinator::with_engine(engine.clone(), HashMap::new());
        let ctx = AgentContext::new("orchestrator");

        let workflow = failure().workflow;
        let first = engine.coordinate_agents(&workflow, &ctx).await;
        assert!(!first.success);

        let result = coordinator
            .handle_failure(&WorkflowFailure::new(workflow, first), &ctx)
            .await;
        assert_eq!(result.strategy, Some(RecoveryStrategy::Retry));
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_handler_retargets_failed_steps() {
        let primary = ScriptedAgent::new("sql_generation")
            .always(Behavior::Raise("model offline".into()))
            .arc();
        let backup = ScriptedAgent::new("sql_generation_simple").arc();
        let (protocol, _log) = protocol_with(single_attempt(), vec![primary.clone(), backup.clone()]).await;
        let engine = Arc::new(WorkflowEngine::new(protocol, Duration::from_secs(5)));
        let fallbacks = HashMap::from([(
            "sql_generation".to_string(),
            "sql_generation_simple".to_string(),
        )]);
        let coordinator = RecoveryCoordinator::with_engine(engine.clone(), fallbacks);
        let ctx = AgentContext::new("orchestrator");

        let workflow = failure().workflow;
        let first = engine.coordinate_agents(&workflow, &ctx).await;
        let result = coordinator
            .handle_failure(&WorkflowFailure::new(workflow.clone(), first), &ctx)
            .await;

        assert!(result.success);
        assert_eq!(result.strategy, Some(RecoveryStrategy::Fallback));
        assert_eq!(backup.calls(), 1);
        let recovered = result.recovered.unwrap();
        assert_eq!(recovered.steps[0].agent_type, "sql_generation_simple");
        // the submitted definition is left alone
        assert_eq!(workflow.steps[0].agent_type, "sql_generation");
    }

    #[tokio::test]
    async fn test_simplify_handler_needs_optional_steps() {
        let (protocol, _log) = protocol_with(single_attempt(), vec![]).await;
        let engine = Arc::new(WorkflowEngine::new(protocol, Duration::from_secs(5)));
        let handler = SimplifyHandler::new(engine);

        let err = handler
            .recover(&failure(), &AgentContext::new("orchestrator"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no optional steps"));
    }

    #[tokio::test]
    async fn test_simplify_handler_drops_optional_steps() {
        let chart = ScriptedAgent::new("visualization").arc();
        let sql = ScriptedAgent::new("sql_generation").arc();
        let (protocol, _log) = protocol_with(single_attempt(), vec![chart.clone(), sql.clone()]).await;
        let engine = Arc::new(WorkflowEngine::new(protocol, Duration::from_secs(5)));
        let handler = SimplifyHandler::new(engine);

        let workflow = WorkflowDefinition::new("report")
            .with_step(WorkflowStep::new("generate", "sql_generation", 0, notify("g")))
            .with_step(WorkflowStep::new("chart", "visualization", 1, notify("c")).optional());
        let mut failed = WorkflowResult::start(&workflow);
        failed.abort("Required step 'generate' failed: timeout");

        let rerun = handler
            .recover(&WorkflowFailure::new(workflow, failed), &AgentContext::new("orchestrator"))
            .await
            .unwrap();
        assert!(rerun.success);
        assert_eq!(rerun.steps.len(), 1);
        assert_eq!(chart.calls(), 0);
        assert_eq!(sql.calls(), 1);
    }
}
