//! Capability registry: which agents are live, what they can do, and how to reach them

use crate::agent::{Agent, AgentCapability};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Constructor used when an agent is requested but not registered
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

struct CachedCapability {
    capability: AgentCapability,
    expires_at: Instant,
}

/// Registry of live agents keyed by agent type name
pub struct CapabilityRegistry {
    agents: DashMap<String, Arc<dyn Agent>>,
    capability_cache: DashMap<String, CachedCapability>,
    factories: DashMap<String, AgentFactory>,
    config: RegistryConfig,
    health_check_timeout: Duration,
}

impl CapabilityRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig, health_check_timeout: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            capability_cache: DashMap::new(),
            factories: DashMap::new(),
            config,
            health_check_timeout,
        }
    }

    /// Register an agent, replacing any agent with the same type name.
    ///
    /// The agent's `initialize` hook runs before it becomes reachable.
    /// Re-registering the same instance only refreshes its cached descriptor.
    pub async fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.agent_type().to_string();
        if name.is_empty() {
            return Err(Error::invalid_input("agent type name must not be empty"));
        }

        let existing = self.agents.get(&name).map(|entry| entry.value().clone());
        let already_registered = existing
            .as_ref()
            .map(|current| Arc::ptr_eq(current, &agent))
            .unwrap_or(false);

        if !already_registered {
            agent.initialize(&self.config.agent_settings).await?;
            self.agents.insert(name.clone(), agent.clone());

            if let Some(replaced) = existing {
                if let Err(e) = replaced.shutdown().await {
                    tracing::warn!("Replaced agent {} failed to shut down: {}", name, e);
                }
            }
            tracing::info!(agent = %name, "Registered agent");
        }

        self.cache_capability(agent.capabilities());
        Ok(())
    }

    /// Remove an agent and its cached descriptor. Unknown names are a no-op.
    ///
    /// Returns whether an agent was removed.
    pub async fn unregister(&self, agent_type: &str) -> bool {
        self.capability_cache.remove(agent_type);

        let Some((_, agent)) = self.agents.remove(agent_type) else {
            return false;
        };

        if let Err(e) = agent.shutdown().await {
            tracing::warn!("Agent {} failed to shut down: {}", agent_type, e);
        }
        tracing::info!(agent = %agent_type, "Unregistered agent");
        true
    }

    /// Register a constructor used by [`resolve`](Self::resolve) when no live agent exists
    pub fn register_factory(&self, agent_type: impl Into<String>, factory: AgentFactory) {
        self.factories.insert(agent_type.into(), factory);
    }

    /// Find an agent: live registration first, then the static fallback mapping
    pub fn resolve(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        if let Some(agent) = self.agents.get(agent_type) {
            return Some(agent.value().clone());
        }

        let factory = self.factories.get(agent_type).map(|f| f.value().clone())?;
        tracing::debug!(agent = %agent_type, "Resolved agent through static fallback");
        Some(factory())
    }

    /// Health-check every registered agent and return their descriptors.
    ///
    /// An agent whose probe errors or times out is logged and left out; it
    /// never fails the whole discovery.
    pub async fn discover_capabilities(&self) -> Vec<AgentCapability> {
        let snapshot: Vec<(String, Arc<dyn Agent>)> = self
            .agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let probes = snapshot.into_iter().map(|(name, agent)| async move {
            let outcome = tokio::time::timeout(self.health_check_timeout, agent.health_status()).await;
            (name, agent, outcome)
        });

        let mut discovered = Vec::new();
        for (name, agent, outcome) in join_all(probes).await {
            match outcome {
                Ok(Ok(health)) => {
                    let mut capability = agent.capabilities();
                    capability.is_available = health.is_healthy;
                    capability.last_health_check = Utc::now();
                    if !health.is_healthy {
                        tracing::debug!(agent = %name, issues = ?health.issues, "Agent reports unhealthy");
                    }
                    self.cache_capability(capability.clone());
                    discovered.push(capability);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Health check for agent {} failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Health check for agent {} timed out after {:?}",
                        name,
                        self.health_check_timeout
                    );
                }
            }
        }

        discovered.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        discovered
    }

    /// Cached descriptor, if present and not expired
    pub fn cached_capability(&self, agent_type: &str) -> Option<AgentCapability> {
        let expired = match self.capability_cache.get(agent_type) {
            Some(cached) if cached.expires_at > Instant::now() => {
                return Some(cached.capability.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.capability_cache.remove(agent_type);
        }
        None
    }

    /// Registered agent type names, sorted
    pub fn agent_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether an agent with this type name is registered
    pub fn contains(&self, agent_type: &str) -> bool {
        self.agents.contains_key(agent_type)
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Unregister every agent, running their shutdown hooks
    pub async fn shutdown(&self) {
        for name in self.agent_types() {
            self.unregister(&name).await;
        }
    }

    fn cache_capability(&self, capability: AgentCapability) {
        let expires_at = Instant::now() + self.config.capability_ttl();
        self.capability_cache.insert(
            capability.agent_type.clone(),
            CachedCapability {
                capability,
                expires_at,
            },
        );
    }
}
