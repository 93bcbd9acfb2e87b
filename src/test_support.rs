//! Scripted agents shared by the unit tests

use crate::agent::{Agent, AgentCapability, AgentOperation, AgentRequest, AgentResponse, HealthStatus};
use crate::error::{Error, Result};
use crate::types::AgentContext;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted agent does on one call
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Return a successful response with this payload
    Succeed(serde_json::Value),
    /// Return a response with `success == false`
    Decline(String),
    /// Return an `Err`
    Raise(String),
    /// Return an `Err` classified as invalid input
    Reject(String),
    /// Sleep, then succeed
    Hang(Duration),
}

pub(crate) struct ScriptedAgent {
    agent_type: String,
    script: Mutex<VecDeque<Behavior>>,
    default: Mutex<Behavior>,
    calls: AtomicUsize,
    healthy: AtomicBool,
    health_probe_fails: AtomicBool,
    pub(crate) initialized: AtomicBool,
    pub(crate) shut_down: AtomicBool,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub(crate) fn new(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Behavior::Succeed(json!({ "agent": agent_type }))),
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            health_probe_fails: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Behavior used once the script is exhausted
    pub(crate) fn always(self, behavior: Behavior) -> Self {
        *self.default.lock() = behavior;
        self
    }

    /// Queue a behavior for the next call
    pub(crate) fn then(self, behavior: Behavior) -> Self {
        self.script.lock().push_back(behavior);
        self
    }

    pub(crate) fn set_default(&self, behavior: Behavior) {
        *self.default.lock() = behavior;
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn fail_health_probe(&self) {
        self.health_probe_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn capabilities(&self) -> AgentCapability {
        AgentCapability::new(&self.agent_type)
            .with_operation("notify")
            .with_metadata("version", json!("test"))
    }

    async fn process(&self, request: AgentRequest, _context: &AgentContext) -> Result<AgentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());

        match behavior {
            Behavior::Succeed(value) => Ok(AgentResponse::success(request.id, value)),
            Behavior::Decline(message) => Ok(AgentResponse::failure(request.id, message)),
            Behavior::Raise(message) => Err(Error::agent(message)),
            Behavior::Reject(message) => Err(Error::invalid_input(message)),
            Behavior::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(AgentResponse::success(request.id, json!({ "late": true })))
            }
        }
    }

    async fn health_status(&self) -> Result<HealthStatus> {
        if self.health_probe_fails.load(Ordering::SeqCst) {
            return Err(Error::agent("health probe crashed"));
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(HealthStatus::healthy())
        } else {
            Ok(HealthStatus::unhealthy(vec!["database offline".to_string()]))
        }
    }

    async fn initialize(&self, _settings: &HashMap<String, serde_json::Value>) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Request used where the operation itself does not matter
pub(crate) fn notify_request() -> AgentRequest {
    AgentRequest::new(AgentOperation::Notify(crate::agent::AgentEvent::new(
        "ping",
        json!({}),
    )))
}

/// Protocol over an in-memory log with the given agents registered
pub(crate) async fn protocol_with(
    config: crate::config::ProtocolConfig,
    agents: Vec<Arc<ScriptedAgent>>,
) -> (
    Arc<crate::protocol::CommunicationProtocol>,
    Arc<crate::log::InMemoryCommunicationLog>,
) {
    let registry = Arc::new(crate::registry::CapabilityRegistry::new(
        crate::config::RegistryConfig::default(),
        config.health_check_timeout(),
    ));
    for agent in agents {
        registry.register(agent).await.expect("register agent");
    }

    let log = Arc::new(crate::log::InMemoryCommunicationLog::new());
    let protocol = Arc::new(crate::protocol::CommunicationProtocol::new(
        registry,
        log.clone(),
        config,
    ));
    (protocol, log)
}
