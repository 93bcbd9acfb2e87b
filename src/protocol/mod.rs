//! Communication protocol - typed request/response messaging between agents
//!
//! Every exchange goes through the same path regardless of which execution
//! mode triggered it:
//!
//! 1. Resolve the target through the [`CapabilityRegistry`]
//! 2. Build a fresh [`MessageEnvelope`]
//! 3. Call the agent under the retry policy and the target's circuit breaker,
//!    each attempt bounded by a deadline
//! 4. Decode the payload into the type expected by the caller
//! 5. Append one [`CommunicationLogEntry`](crate::log::CommunicationLogEntry),
//!    best-effort

pub mod circuit_breaker;
pub mod envelope;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use envelope::MessageEnvelope;
pub use retry::RetryPolicy;

use crate::agent::{Agent, AgentEvent, AgentOperation, AgentRequest, AgentResponse};
use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::log::CommunicationLog;
use crate::registry::CapabilityRegistry;
use crate::types::AgentContext;
use dashmap::DashMap;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Point-to-point messaging with timeouts, retries, circuit breaking and logging
pub struct CommunicationProtocol {
    registry: Arc<CapabilityRegistry>,
    log: Arc<dyn CommunicationLog>,
    config: ProtocolConfig,
    retry: RetryPolicy,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CommunicationProtocol {
    /// Create a protocol over a registry and a log
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        log: Arc<dyn CommunicationLog>,
        config: ProtocolConfig,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            registry,
            log,
            config,
            retry,
            breakers: DashMap::new(),
        }
    }

    /// The registry used for resolution
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// The communication log
    pub fn log(&self) -> &Arc<dyn CommunicationLog> {
        &self.log
    }

    /// Deadline used when the caller supplies none
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    /// Breaker guarding a target, created closed on first use
    pub fn circuit_breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::from_config(target, &self.config.circuit_breaker))
            })
            .value()
            .clone()
    }

    /// Breaker state of a target; closed when the target was never called
    pub fn circuit_state(&self, target: &str) -> CircuitState {
        self.breakers
            .get(target)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Send a request and receive the raw JSON response
    pub async fn send(
        &self,
        target: &str,
        request: AgentRequest,
        context: &AgentContext,
        timeout: Option<Duration>,
    ) -> Result<AgentResponse> {
        self.send_typed::<serde_json::Value>(target, request, context, timeout)
            .await
    }

    /// Send a request and decode the result into `T`.
    ///
    /// Agent-reported failures (`success == false`) are returned as `Ok`;
    /// `Err` is reserved for exchanges that could not complete.
    pub async fn send_typed<T: DeserializeOwned>(
        &self,
        target: &str,
        request: AgentRequest,
        context: &AgentContext,
        timeout: Option<Duration>,
    ) -> Result<AgentResponse<T>> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let expected = std::any::type_name::<T>();
        let started = Instant::now();

        let envelope = MessageEnvelope::new(
            context.correlation_id,
            &context.active_agent,
            target,
            request,
            timeout,
            expected,
        );

        let (outcome, attempts) = match self.registry.resolve(target) {
            Some(agent) => self.call_with_policy(agent, &envelope, context, timeout).await,
            None => (Err(Error::agent_unavailable(target)), 0),
        };

        let elapsed = started.elapsed();
        let outcome = outcome.and_then(|response| {
            response
                .with_execution_time(elapsed.as_millis() as u64)
                .into_typed::<T>()
                .map_err(|e| Error::ResponseTypeMismatch {
                    agent: target.to_string(),
                    expected: expected.to_string(),
                    message: e.to_string(),
                })
        });

        let (success, error) = match &outcome {
            Ok(response) => (response.success, response.error.clone()),
            Err(e) => (false, Some(e.to_string())),
        };
        self.record(&envelope, success, error, elapsed, attempts).await;

        outcome
    }

    /// Deliver an event to every other registered agent, or to `targets`.
    ///
    /// The sender (`context.active_agent`) is skipped. Each delivery is
    /// isolated; failures are logged and never cancel the others.
    pub async fn broadcast(
        &self,
        event: AgentEvent,
        context: &AgentContext,
        targets: Option<&[String]>,
    ) {
        let candidates = match targets {
            Some(targets) => targets.to_vec(),
            None => self.registry.agent_types(),
        };

        let mut seen = HashSet::new();
        let recipients: Vec<String> = candidates
            .into_iter()
            .filter(|name| name != &context.active_agent && seen.insert(name.clone()))
            .collect();

        tracing::debug!(event = %event.name, recipients = recipients.len(), "Broadcasting event");

        let event_name = event.name.clone();
        let deliveries = recipients.iter().map(|target| {
            let request = AgentRequest::new(AgentOperation::Notify(event.clone()));
            let event_name = &event_name;
            async move {
                match self.send(target, request, context, None).await {
                    Ok(response) if !response.success => tracing::warn!(
                        "Agent {} rejected event {}: {}",
                        target,
                        event_name,
                        response.error.unwrap_or_default()
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Broadcast of {} to {} failed: {}", event_name, target, e),
                }
            }
        });

        join_all(deliveries).await;
    }

    /// Run the attempts of one exchange. Returns the outcome and the number
    /// of attempts that reached the agent.
    async fn call_with_policy(
        &self,
        agent: Arc<dyn Agent>,
        envelope: &MessageEnvelope,
        context: &AgentContext,
        timeout: Duration,
    ) -> (Result<AgentResponse>, u32) {
        let breaker = self.circuit_breaker(&envelope.target);
        let mut attempt = 0;

        loop {
            if !breaker.try_acquire() {
                tracing::debug!(agent = %envelope.target, "Circuit open, failing fast");
                return (Err(Error::CircuitOpen(envelope.target.clone())), attempt);
            }
            attempt += 1;

            let result =
                match tokio::time::timeout(timeout, agent.process(envelope.payload.clone(), context)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(&envelope.target, timeout)),
                };

            match result {
                Ok(response) => {
                    breaker.record_success();
                    return (Ok(response), attempt);
                }
                Err(e) => {
                    breaker.record_failure();

                    // every error here came from the agent call or its deadline
                    if !self.retry.has_attempts_after(attempt) {
                        return (Err(e), attempt);
                    }

                    let backoff = self.retry.backoff_after(attempt);
                    tracing::warn!(
                        "Agent {} failed (attempt {}/{}): {}; retrying in {:?}",
                        envelope.target,
                        attempt,
                        self.retry.max_attempts(),
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn record(
        &self,
        envelope: &MessageEnvelope,
        success: bool,
        error: Option<String>,
        elapsed: Duration,
        attempts: u32,
    ) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("attempts".to_string(), attempts.into());
        metadata.insert(
            "circuit_state".to_string(),
            serde_json::to_value(self.circuit_state(&envelope.target)).unwrap_or_default(),
        );

        let entry = envelope.to_log_entry(success, elapsed, error, metadata);
        if let Err(e) = self.log.append(&entry).await {
            tracing::warn!(
                "Failed to write communication log entry for {} -> {}: {}",
                envelope.source,
                envelope.target,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolConfig, RetryConfig};
    use crate::log::{CommunicationLogEntry, InMemoryCommunicationLog, LogQuery};
    use crate::test_support::{notify_request, protocol_with, Behavior, ScriptedAgent};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    fn single_attempt() -> ProtocolConfig {
        ProtocolConfig {
            retry: RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
            ..ProtocolConfig::default()
        }
    }

    async fn only_entry(log: &InMemoryCommunicationLog) -> CommunicationLogEntry {
        let mut rows = log.query(&LogQuery::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        rows.remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt_with_backoff() {
        let agent = ScriptedAgent::new("sql_generation")
            .then(Behavior::Raise("first".into()))
            .then(Behavior::Raise("second".into()))
            .always(Behavior::Succeed(json!({ "sql": "SELECT 1" })))
            .arc();
        let (protocol, log) = protocol_with(ProtocolConfig::default(), vec![agent.clone()]).await;
        let ctx = AgentContext::new("orchestrator");

        let started = Instant::now();
        let response = protocol
            .send("sql_generation", notify_request(), &ctx, None)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(response.success);
        assert_eq!(response.result, Some(json!({ "sql": "SELECT 1" })));
        assert_eq!(agent.calls(), 3);
        // two sleeps: 100 ms then 200 ms
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(350));

        let entry = only_entry(&log).await;
        assert!(entry.success);
        assert_eq!(entry.metadata["attempts"], 3);
        assert_eq!(entry.correlation_id, ctx.correlation_id);
        assert_eq!(protocol.circuit_breaker("sql_generation").consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_agent_error_is_retried() {
        let agent = ScriptedAgent::new("sql_generation")
            .then(Behavior::Reject("upstream rejected payload".into()))
            .then(Behavior::Reject("upstream rejected payload".into()))
            .always(Behavior::Succeed(json!({ "sql": "SELECT 2" })))
            .arc();
        let (protocol, log) = protocol_with(ProtocolConfig::default(), vec![agent.clone()]).await;
        let ctx = AgentContext::new("orchestrator");

        let response = protocol
            .send("sql_generation", notify_request(), &ctx, None)
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(agent.calls(), 3);
        assert_eq!(only_entry(&log).await.metadata["attempts"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_half_open_trial_closes_it() {
        let agent = ScriptedAgent::new("schema_navigation")
            .always(Behavior::Raise("db down".into()))
            .arc();
        let (protocol, _log) = protocol_with(single_attempt(), vec![agent.clone()]).await;
        let ctx = AgentContext::new("orchestrator");

        for _ in 0..5 {
            let err = protocol
                .send("schema_navigation", notify_request(), &ctx, None)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Agent(_)));
        }
        assert_eq!(protocol.circuit_state("schema_navigation"), CircuitState::Open);

        let err = protocol
            .send("schema_navigation", notify_request(), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
        assert_eq!(agent.calls(), 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        agent.set_default(Behavior::Succeed(json!("back")));

        let response = protocol
            .send("schema_navigation", notify_request(), &ctx, None)
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(agent.calls(), 6);
        assert_eq!(protocol.circuit_state("schema_navigation"), CircuitState::Closed);
        assert_eq!(protocol.circuit_breaker("schema_navigation").consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried_then_surfaced() {
        let agent = ScriptedAgent::new("sql_execution")
            .always(Behavior::Hang(Duration::from_secs(60)))
            .arc();
        let (protocol, log) = protocol_with(ProtocolConfig::default(), vec![agent.clone()]).await;
        let ctx = AgentContext::new("orchestrator");

        let err = protocol
            .send("sql_execution", notify_request(), &ctx, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(agent.calls(), 3);
        let entry = only_entry(&log).await;
        assert!(!entry.success);
        assert!(entry.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_target_fails_fast_and_is_logged() {
        let (protocol, log) = protocol_with(ProtocolConfig::default(), vec![]).await;
        let ctx = AgentContext::new("orchestrator");

        let err = protocol
            .send("ghost", notify_request(), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentUnavailable(_)));

        let entry = only_entry(&log).await;
        assert_eq!(entry.target_agent, "ghost");
        assert_eq!(entry.metadata["attempts"], 0);
    }

    #[tokio::test]
    async fn test_declined_response_is_not_retried() {
        let agent = ScriptedAgent::new("query_understanding")
            .always(Behavior::Decline("ambiguous question".into()))
            .arc();
        let (protocol, log) = protocol_with(ProtocolConfig::default(), vec![agent.clone()]).await;
        let ctx = AgentContext::new("orchestrator");

        let response = protocol
            .send("query_understanding", notify_request(), &ctx, None)
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.is_consistent());
        assert_eq!(agent.calls(), 1);

        let entry = only_entry(&log).await;
        assert!(!entry.success);
        assert_eq!(entry.error_message.as_deref(), Some("ambiguous question"));
    }

    #[derive(Debug, Deserialize)]
    struct GeneratedSql {
        #[allow(dead_code)]
        sql: String,
    }

    #[tokio::test]
    async fn test_typed_send_reports_mismatch() {
        let agent = ScriptedAgent::new("sql_generation")
            .always(Behavior::Succeed(json!("SELECT * FROM sales")))
            .arc();
        let (protocol, log) = protocol_with(ProtocolConfig::default(), vec![agent]).await;
        let ctx = AgentContext::new("orchestrator");

        let err = protocol
            .send_typed::<GeneratedSql>("sql_generation", notify_request(), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResponseTypeMismatch { .. }));

        let entry = only_entry(&log).await;
        assert!(!entry.success);
        assert!(entry.metadata["response_type"]
            .as_str()
            .unwrap()
            .ends_with("GeneratedSql"));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_isolates_failures() {
        let sender = ScriptedAgent::new("orchestrator").arc();
        let broken = ScriptedAgent::new("broken")
            .always(Behavior::Raise("nope".into()))
            .arc();
        let listener = ScriptedAgent::new("listener").arc();
        let (protocol, _log) = protocol_with(
            single_attempt(),
            vec![sender.clone(), broken.clone(), listener.clone()],
        )
        .await;
        let ctx = AgentContext::new("orchestrator");

        protocol
            .broadcast(AgentEvent::new("schema_changed", json!({ "table": "sales" })), &ctx, None)
            .await;

        assert_eq!(sender.calls(), 0);
        assert_eq!(broken.calls(), 1);
        assert_eq!(listener.calls(), 1);
        assert!(matches!(
            listener.requests()[0].operation,
            AgentOperation::Notify(ref event) if event.name == "schema_changed"
        ));

        let subset = vec!["listener".to_string(), "listener".to_string()];
        protocol
            .broadcast(AgentEvent::new("cache_cleared", json!(null)), &ctx, Some(&subset))
            .await;
        assert_eq!(listener.calls(), 2);
        assert_eq!(broken.calls(), 1);
    }

    struct BrokenLog;

    #[async_trait]
    impl CommunicationLog for BrokenLog {
        async fn append(&self, _entry: &CommunicationLogEntry) -> Result<()> {
            Err(Error::storage("disk full"))
        }

        async fn query(&self, _query: &LogQuery) -> Result<Vec<CommunicationLogEntry>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_log_failures_do_not_fail_the_call() {
        let registry = Arc::new(CapabilityRegistry::new(
            Default::default(),
            Duration::from_secs(1),
        ));
        registry.register(ScriptedAgent::new("visualization").arc()).await.unwrap();
        let protocol = CommunicationProtocol::new(registry, Arc::new(BrokenLog), ProtocolConfig::default());

        let response = protocol
            .send("visualization", notify_request(), &AgentContext::new("orchestrator"), None)
            .await
            .unwrap();
        assert!(response.success);
    }
}
