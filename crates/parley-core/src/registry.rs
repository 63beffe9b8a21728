//! Agent registry.
//!
//! Holds at most one agent per session key, guards concurrent creation with
//! a pending set, and reaps agents that have been idle past the configured
//! threshold.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use parley_config::Config;

use crate::agent::{Agent, AgentContext};
use crate::error::StartError;
use crate::provider::GenerationProvider;
use crate::tools::ToolRegistry;
use crate::transport::{BotIdentity, TransportFactory};

/// Stable identifier for one user's agent in one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn derive(user_id: &str, channel_id: &str) -> Self {
        let raw = format!("parley-bot-{user_id}-{channel_id}");
        Self(raw.replace('!', ""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What `get_or_create` found or did.
pub enum StartOutcome {
    /// A fresh agent was built and registered.
    Created(Arc<Agent>),
    /// An agent for this key already existed.
    Existing(Arc<Agent>),
    /// Another caller is mid-creation for this key; nothing was started.
    Pending,
}

impl std::fmt::Debug for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Created(_) => f.write_str("Created(..)"),
            StartOutcome::Existing(_) => f.write_str("Existing(..)"),
            StartOutcome::Pending => f.write_str("Pending"),
        }
    }
}

/// Where a session key currently stands in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Pending,
    Absent,
}

#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub active_agents: usize,
    pub pending_agents: usize,
    pub conversations: Vec<String>,
}

struct RegistryState {
    active: HashMap<SessionKey, Arc<Agent>>,
    pending: HashSet<SessionKey>,
}

pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    factory: Arc<dyn TransportFactory>,
    provider: Arc<dyn GenerationProvider>,
    tools: Arc<ToolRegistry>,
    config: Config,
    inactivity_threshold: Duration,
    reaper_interval: Duration,
}

impl AgentRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        provider: Arc<dyn GenerationProvider>,
        tools: Arc<ToolRegistry>,
        config: Config,
    ) -> Self {
        let inactivity_threshold =
            Duration::from_secs(config.agents.inactivity_threshold_secs);
        let reaper_interval = Duration::from_secs(config.agents.reaper_interval_secs.max(1));
        Self {
            state: Mutex::new(RegistryState {
                active: HashMap::new(),
                pending: HashSet::new(),
            }),
            factory,
            provider,
            tools,
            config,
            inactivity_threshold,
            reaper_interval,
        }
    }

    /// Single-flight agent creation. The key is reserved in the pending set
    /// before the (slow) build happens outside the lock; a concurrent caller
    /// for the same key gets `Pending` instead of a second build.
    pub async fn get_or_create(
        &self,
        key: &SessionKey,
        ctx: &AgentContext,
    ) -> Result<StartOutcome, StartError> {
        {
            let mut state = self.state.lock().await;
            if let Some(agent) = state.active.get(key) {
                debug!("agent for {key} already active");
                return Ok(StartOutcome::Existing(Arc::clone(agent)));
            }
            if !state.pending.insert(key.clone()) {
                debug!("agent for {key} already being created");
                return Ok(StartOutcome::Pending);
            }
        }

        let built = self.build_agent(key, ctx).await;

        let mut state = self.state.lock().await;
        state.pending.remove(key);
        let agent = match built {
            Ok(agent) => agent,
            Err(e) => return Err(e),
        };

        // A racing remove-then-start can land a winner between our unlock and
        // relock. The winner stays; our build is torn down explicitly.
        if let Some(winner) = state.active.get(key) {
            let winner = Arc::clone(winner);
            drop(state);
            warn!("lost creation race for {key}, disposing duplicate");
            agent.dispose().await;
            if let Err(e) = self.factory.delete_identity(key.as_str()).await {
                warn!("failed to delete duplicate identity {key}: {e:#}");
            }
            return Ok(StartOutcome::Existing(winner));
        }

        state.active.insert(key.clone(), Arc::clone(&agent));
        info!(
            "agent created for {key} ({} active)",
            state.active.len()
        );
        Ok(StartOutcome::Created(agent))
    }

    async fn build_agent(
        &self,
        key: &SessionKey,
        ctx: &AgentContext,
    ) -> Result<Arc<Agent>, StartError> {
        let identity = BotIdentity {
            id: key.as_str().to_string(),
            name: "AI Assistant".to_string(),
            conversation_id: ctx.conversation_id.clone(),
        };
        let transport = self
            .factory
            .create(&identity)
            .await
            .map_err(StartError::CreationFailed)?;

        let agent = Arc::new(Agent::new(
            transport,
            Arc::clone(&self.provider),
            Arc::clone(&self.tools),
            ctx.conversation_id.clone(),
            &self.config,
        ));
        agent.init(ctx).await?;
        Ok(agent)
    }

    /// Stop and unregister the agent for `key`. A no-op when absent.
    pub async fn remove(&self, key: &SessionKey) {
        let agent = {
            let mut state = self.state.lock().await;
            state.active.remove(key)
        };
        let Some(agent) = agent else {
            debug!("no agent to remove for {key}");
            return;
        };
        agent.dispose().await;
        if let Err(e) = self.factory.delete_identity(key.as_str()).await {
            warn!("failed to delete identity {key}: {e:#}");
        }
        info!("agent removed for {key}");
    }

    pub async fn key_status(&self, key: &SessionKey) -> KeyStatus {
        let state = self.state.lock().await;
        if state.active.contains_key(key) {
            KeyStatus::Active
        } else if state.pending.contains(key) {
            KeyStatus::Pending
        } else {
            KeyStatus::Absent
        }
    }

    pub async fn status(&self) -> AgentStatus {
        let state = self.state.lock().await;
        let mut conversations: Vec<String> = state
            .active
            .values()
            .map(|a| a.conversation_id().to_string())
            .collect();
        conversations.sort();
        AgentStatus {
            active_agents: state.active.len(),
            pending_agents: state.pending.len(),
            conversations,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// One reaper pass: find agents idle past the threshold and remove them.
    /// Idleness checks and disposal run outside the registry lock.
    pub async fn reap_idle(&self) {
        let snapshot: Vec<(SessionKey, Arc<Agent>)> = {
            let state = self.state.lock().await;
            state
                .active
                .iter()
                .map(|(k, a)| (k.clone(), Arc::clone(a)))
                .collect()
        };
        for (key, agent) in snapshot {
            let idle = agent.last_interaction().await.elapsed();
            if idle >= self.inactivity_threshold {
                info!(
                    "reaping agent {key} after {}s idle",
                    idle.as_secs()
                );
                self.remove(&key).await;
            }
        }
    }

    /// Periodic idle sweep; runs until the returned handle is aborted.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.reap_idle().await;
            }
        })
    }

    /// Dispose every active agent. Used on shutdown.
    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = {
            let state = self.state.lock().await;
            state.active.keys().cloned().collect()
        };
        for key in keys {
            self.remove(&key).await;
        }
        if self.active_count().await != 0 {
            error!("agents still registered after shutdown sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CountingFactory, RecordingTransport, ScriptedProvider};
    use std::sync::atomic::Ordering;

    #[test]
    fn session_key_strips_bangs() {
        let key = SessionKey::derive("user-1", "messaging!general");
        assert_eq!(key.as_str(), "parley-bot-user-1-messaginggeneral");
    }

    #[test]
    fn session_key_is_stable() {
        let a = SessionKey::derive("u", "c");
        let b = SessionKey::derive("u", "c");
        assert_eq!(a, b);
    }

    fn ctx(conversation_id: &str) -> AgentContext {
        AgentContext {
            conversation_id: conversation_id.to_string(),
            agreement_summary: None,
            user: None,
        }
    }

    fn registry_with(
        factory: Arc<CountingFactory>,
        inactivity_threshold_secs: u64,
    ) -> Arc<AgentRegistry> {
        let mut config = Config::default();
        config.agents.inactivity_threshold_secs = inactivity_threshold_secs;
        Arc::new(AgentRegistry::new(
            factory,
            ScriptedProvider::new(Vec::new()),
            Arc::new(ToolRegistry::new()),
            config,
        ))
    }

    #[tokio::test]
    async fn second_start_for_same_key_reuses_the_agent() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::new(transport);
        let registry = registry_with(Arc::clone(&factory), 3600);
        let key = SessionKey::derive("u1", "c1");

        let first = registry.get_or_create(&key, &ctx("c1")).await.unwrap();
        assert!(matches!(first, StartOutcome::Created(_)));
        let second = registry.get_or_create(&key, &ctx("c1")).await.unwrap();
        assert!(matches!(second, StartOutcome::Existing(_)));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_starts_build_exactly_one_agent() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::slow(transport, Duration::from_millis(50));
        let registry = registry_with(Arc::clone(&factory), 3600);
        let key = SessionKey::derive("u1", "c1");

        let context = ctx("c1");
        let (a, b) = tokio::join!(
            registry.get_or_create(&key, &context),
            registry.get_or_create(&key, &context),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let created = [&a, &b]
            .iter()
            .filter(|o| matches!(o, StartOutcome::Created(_)))
            .count();
        let pending = [&a, &b]
            .iter()
            .filter(|o| matches!(o, StartOutcome::Pending))
            .count();
        assert_eq!(created, 1);
        assert_eq!(pending, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn creation_failure_clears_the_reservation() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::new(transport);
        factory.fail_creation.store(true, Ordering::SeqCst);
        let registry = registry_with(Arc::clone(&factory), 3600);
        let key = SessionKey::derive("u1", "c1");

        let err = registry.get_or_create(&key, &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, StartError::CreationFailed(_)));
        assert_eq!(registry.status().await.pending_agents, 0);

        // The key is free again.
        factory.fail_creation.store(false, Ordering::SeqCst);
        let retry = registry.get_or_create(&key, &ctx("c1")).await.unwrap();
        assert!(matches!(retry, StartOutcome::Created(_)));
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_start() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::new(transport);
        let provider = ScriptedProvider::new(Vec::new());
        provider.credentials_ok.store(false, Ordering::SeqCst);
        let registry = Arc::new(AgentRegistry::new(
            factory,
            provider,
            Arc::new(ToolRegistry::new()),
            Config::default(),
        ));
        let key = SessionKey::derive("u1", "c1");

        let err = registry.get_or_create(&key, &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, StartError::MissingCredential(_)));
        assert_eq!(registry.status().await.pending_agents, 0);
    }

    #[tokio::test]
    async fn key_status_tracks_the_lifecycle() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::new(transport);
        let registry = registry_with(factory, 3600);
        let key = SessionKey::derive("u1", "c1");

        assert_eq!(registry.key_status(&key).await, KeyStatus::Absent);
        registry.get_or_create(&key, &ctx("c1")).await.unwrap();
        assert_eq!(registry.key_status(&key).await, KeyStatus::Active);
        registry.remove(&key).await;
        assert_eq!(registry.key_status(&key).await, KeyStatus::Absent);
    }

    #[tokio::test]
    async fn remove_disposes_and_deletes_the_identity() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::new(Arc::clone(&transport));
        let registry = registry_with(Arc::clone(&factory), 3600);
        let key = SessionKey::derive("u1", "c1");

        registry.get_or_create(&key, &ctx("c1")).await.unwrap();
        registry.remove(&key).await;
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(*factory.deleted.lock().unwrap(), vec![key.as_str().to_string()]);

        // Removing an absent key is a quiet no-op.
        registry.remove(&key).await;
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_only_idle_agents() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::new(Arc::clone(&transport));
        let registry = registry_with(Arc::clone(&factory), 5);
        let fresh = SessionKey::derive("u1", "c1");
        let stale = SessionKey::derive("u2", "c2");

        registry.get_or_create(&stale, &ctx("c2")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        registry.get_or_create(&fresh, &ctx("c1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        // stale is 6s idle, fresh only 3s.
        registry.reap_idle().await;
        let status = registry.status().await;
        assert_eq!(status.active_agents, 1);
        assert_eq!(status.conversations, vec!["c1".to_string()]);
        assert_eq!(*factory.deleted.lock().unwrap(), vec![stale.as_str().to_string()]);
    }

    #[tokio::test]
    async fn shutdown_disposes_everything() {
        let transport = RecordingTransport::new();
        let factory = CountingFactory::new(Arc::clone(&transport));
        let registry = registry_with(factory, 3600);

        registry
            .get_or_create(&SessionKey::derive("u1", "c1"), &ctx("c1"))
            .await
            .unwrap();
        registry
            .get_or_create(&SessionKey::derive("u2", "c2"), &ctx("c2"))
            .await
            .unwrap();
        assert_eq!(registry.active_count().await, 2);

        registry.shutdown().await;
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 2);
    }
}
