//! Agent registry: the canonical catalog of agents plus their runtime state.
//!
//! Every agent is two concentric records: an [`AgentConfig`] (declared
//! identity and capability, replaced wholesale on config reloads) and an
//! [`AgentRuntime`] (lifecycle state and counters, owned by this process and
//! preserved across reloads). The registry is the only writer of either.
//!
//! Capacity accounting is the registry's core invariant:
//! `0 <= active_tasks <= max_concurrency`, with the lifecycle state derived
//! from the count — `idle` at zero, `running` in between, `busy` at the cap.
//! `stopped` and `error` are sticky until explicitly cleared via
//! [`AgentRegistry::set_state`].
//!
//! Mutations are serialized through a single `RwLock`; every state
//! transition emits `agent:state-changed` with both sides of the transition,
//! and every catalog change is written through to `agents/agents.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::RwLock;

use crate::agentmesh::bus::{EventBus, ManagerEvent};
use crate::agentmesh::persist::{CatalogFile, PersistError};
use crate::agentmesh::sidechannel::{IndexClient, KEY_AGENTS};
use crate::agentmesh::watcher::ConfigWatcher;

/// The closed set of providers an agent can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "grok")]
    Grok,
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
    #[serde(rename = "codex")]
    Codex,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Grok => "grok",
            ProviderKind::ClaudeCode => "claude-code",
            ProviderKind::GeminiCli => "gemini-cli",
            ProviderKind::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "gemini" => Some(ProviderKind::Gemini),
            "grok" => Some(ProviderKind::Grok),
            "claude-code" => Some(ProviderKind::ClaudeCode),
            "gemini-cli" => Some(ProviderKind::GeminiCli),
            "codex" => Some(ProviderKind::Codex),
            _ => None,
        }
    }

    /// Whether this provider runs as a child process rather than over HTTP.
    pub fn is_subprocess(&self) -> bool {
        matches!(
            self,
            ProviderKind::ClaudeCode | ProviderKind::GeminiCli | ProviderKind::Codex
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport used to reach the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Tcp,
    Http,
}

/// Declared identity and capability of an agent.
///
/// `id` uniquely keys the registry; updates never change it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    pub transport: Transport,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Routing tags; candidate selection matches any listed tag.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Write authority: whether tasks routed here may mutate the workspace.
    #[serde(default)]
    pub can_mutate: bool,
    /// Relative cost unit, >= 0. Used for cost-ordered strategies.
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    /// Per-agent concurrency cap, >= 1.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub binary_path: Option<String>,
    /// Subprocess agents: replaces the provider's default one-shot
    /// arguments when non-empty. The prompt is always appended last.
    #[serde(default)]
    pub cli_args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Subprocess agents only: keep a long-lived JSON-RPC session instead of
    /// one-shot invocations.
    #[serde(default)]
    pub session: bool,
}

fn default_cost_multiplier() -> f64 {
    1.0
}

fn default_max_concurrency() -> u32 {
    1
}

/// Partial update applied by [`AgentRegistry::update`]. Absent fields keep
/// their current value; the id can never change.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub tags: Option<Vec<String>>,
    pub can_mutate: Option<bool>,
    pub cost_multiplier: Option<f64>,
    pub max_concurrency: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub binary_path: Option<String>,
    pub cli_args: Option<Vec<String>>,
    pub cwd: Option<String>,
}

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Running,
    Busy,
    Stopped,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Busy => "busy",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
        }
    }

    /// States in which an agent may accept new tasks.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Running | AgentState::Busy)
    }
}

/// Runtime half of an agent: lifecycle state plus accumulated counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntime {
    pub state: AgentState,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_tasks: u32,
    pub total_tokens_used: u64,
    pub cost_accumulated: f64,
    pub premium_requests: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl AgentRuntime {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            state: AgentState::Idle,
            tasks_completed: 0,
            tasks_failed: 0,
            active_tasks: 0,
            total_tokens_used: 0,
            cost_accumulated: 0.0,
            premium_requests: 0,
            started_at: now,
            last_activity_at: now,
            error: None,
        }
    }
}

/// Config plus runtime — the unit the registry stores per id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstance {
    pub config: AgentConfig,
    pub runtime: AgentRuntime,
}

/// Health summary returned by [`AgentRegistry::get_health`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    pub state: AgentState,
    pub active_tasks: u32,
    pub max_concurrency: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_tokens_used: u64,
    pub cost_accumulated: f64,
    pub last_activity_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Errors surfaced by registry operations.
#[derive(Debug)]
pub enum RegistryError {
    /// No agent with the given id.
    NotFound(String),
    /// Operation refused because the agent still has active tasks.
    AgentBusy { id: String, active_tasks: u32 },
    /// `record_task_start` would exceed `max_concurrency`.
    AtCapacity { id: String, max_concurrency: u32 },
    /// Catalog persistence failed.
    Persist(PersistError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "unknown agent '{}'", id),
            RegistryError::AgentBusy { id, active_tasks } => {
                write!(f, "agent '{}' has {} active task(s)", id, active_tasks)
            }
            RegistryError::AtCapacity { id, max_concurrency } => {
                write!(f, "agent '{}' is at capacity ({})", id, max_concurrency)
            }
            RegistryError::Persist(e) => write!(f, "agent catalog persistence failed: {}", e),
        }
    }
}

impl Error for RegistryError {}

impl From<PersistError> for RegistryError {
    fn from(e: PersistError) -> Self {
        RegistryError::Persist(e)
    }
}

/// State derived from the active-task count for schedulable agents.
fn derived_state(active: u32, max: u32) -> AgentState {
    if active == 0 {
        AgentState::Idle
    } else if active >= max {
        AgentState::Busy
    } else {
        AgentState::Running
    }
}

/// The canonical agent catalog.
pub struct AgentRegistry {
    // Handle back to the owning Arc, for the watcher closure and spawned
    // reload tasks.
    self_weak: Weak<AgentRegistry>,
    agents: RwLock<HashMap<String, AgentInstance>>,
    bus: Arc<EventBus>,
    catalog: CatalogFile,
    side: Option<Arc<IndexClient>>,
    watcher: StdMutex<Option<ConfigWatcher>>,
}

impl AgentRegistry {
    pub fn new(
        catalog_path: impl Into<std::path::PathBuf>,
        bus: Arc<EventBus>,
        side: Option<Arc<IndexClient>>,
    ) -> Arc<Self> {
        let catalog = CatalogFile::new(catalog_path);
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            agents: RwLock::new(HashMap::new()),
            bus,
            catalog,
            side,
            watcher: StdMutex::new(None),
        })
    }

    /// Load the persisted catalog, walking the recovery ladder (primary →
    /// `.bak` → side channel). Every loaded agent starts idle.
    pub async fn load(&self) -> Result<usize, RegistryError> {
        let configs: Vec<AgentConfig> = match self.catalog.load() {
            Ok((configs, _)) => configs,
            Err(err) => {
                log::error!("AgentRegistry: on-disk catalog unusable: {}", err);
                self.recover_from_side_channel().await?
            }
        };
        let mut agents = self.agents.write().await;
        for config in configs {
            agents.insert(
                config.id.clone(),
                AgentInstance {
                    config,
                    runtime: AgentRuntime::fresh(),
                },
            );
        }
        Ok(agents.len())
    }

    async fn recover_from_side_channel(&self) -> Result<Vec<AgentConfig>, RegistryError> {
        let side = match &self.side {
            Some(side) => side,
            None => return Ok(Vec::new()),
        };
        match side.fetch(KEY_AGENTS).await {
            Ok(Some(value)) => {
                let configs: Vec<AgentConfig> =
                    serde_json::from_value(value).unwrap_or_default();
                log::warn!(
                    "AgentRegistry: recovered {} agent(s) from side channel",
                    configs.len()
                );
                self.catalog.save(&configs)?;
                Ok(configs)
            }
            Ok(None) => Ok(Vec::new()),
            Err(e) => {
                log::error!("AgentRegistry: side-channel recovery failed: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Register (or overwrite) an agent. Re-registering an existing id
    /// replaces the config but preserves the runtime instance.
    pub async fn register(&self, config: AgentConfig) -> Result<(), RegistryError> {
        let event;
        let snapshot;
        {
            let mut agents = self.agents.write().await;
            event = ManagerEvent::AgentRegistered {
                agent_id: config.id.clone(),
                name: config.name.clone(),
                provider: config.provider.as_str().to_string(),
            };
            match agents.get_mut(&config.id) {
                Some(existing) => existing.config = config,
                None => {
                    agents.insert(
                        config.id.clone(),
                        AgentInstance {
                            config,
                            runtime: AgentRuntime::fresh(),
                        },
                    );
                }
            }
            snapshot = Self::configs_of(&agents);
        }
        self.bus.emit(&event);
        self.persist(snapshot);
        Ok(())
    }

    /// Remove an agent. Refused while the agent has active tasks.
    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let snapshot;
        {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if instance.runtime.active_tasks > 0 {
                return Err(RegistryError::AgentBusy {
                    id: id.to_string(),
                    active_tasks: instance.runtime.active_tasks,
                });
            }
            agents.remove(id);
            snapshot = Self::configs_of(&agents);
        }
        self.bus.emit(&ManagerEvent::AgentUnregistered {
            agent_id: id.to_string(),
        });
        self.persist(snapshot);
        Ok(())
    }

    /// Apply a partial config update. The id and the runtime counters are
    /// untouched.
    pub async fn update(&self, id: &str, patch: AgentUpdate) -> Result<AgentInstance, RegistryError> {
        let updated;
        let snapshot;
        {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let config = &mut instance.config;
            if let Some(name) = patch.name {
                config.name = name;
            }
            if let Some(model) = patch.model {
                config.model = model;
            }
            if let Some(endpoint) = patch.endpoint {
                config.endpoint = Some(endpoint);
            }
            if let Some(tags) = patch.tags {
                config.tags = tags;
            }
            if let Some(can_mutate) = patch.can_mutate {
                config.can_mutate = can_mutate;
            }
            if let Some(cost) = patch.cost_multiplier {
                config.cost_multiplier = cost.max(0.0);
            }
            if let Some(max) = patch.max_concurrency {
                config.max_concurrency = max.max(1);
            }
            if let Some(timeout) = patch.timeout_ms {
                config.timeout_ms = Some(timeout);
            }
            if let Some(binary) = patch.binary_path {
                config.binary_path = Some(binary);
            }
            if let Some(args) = patch.cli_args {
                config.cli_args = args;
            }
            if let Some(cwd) = patch.cwd {
                config.cwd = Some(cwd);
            }
            updated = instance.clone();
            snapshot = Self::configs_of(&agents);
        }
        self.persist(snapshot);
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<AgentInstance> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<AgentInstance> {
        let agents = self.agents.read().await;
        let mut all: Vec<AgentInstance> = agents.values().cloned().collect();
        all.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        all
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Agents carrying any of the listed tags (OR semantics).
    pub async fn find_by_tags(&self, tags: &[String]) -> Vec<AgentInstance> {
        let agents = self.agents.read().await;
        let mut found: Vec<AgentInstance> = agents
            .values()
            .filter(|a| a.config.tags.iter().any(|t| tags.contains(t)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        found
    }

    pub async fn find_by_provider(&self, provider: ProviderKind) -> Vec<AgentInstance> {
        let agents = self.agents.read().await;
        let mut found: Vec<AgentInstance> = agents
            .values()
            .filter(|a| a.config.provider == provider)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        found
    }

    /// Agents that can accept a task right now: schedulable state and below
    /// their concurrency cap, optionally restricted to a tag set.
    pub async fn find_available(&self, tags: Option<&[String]>) -> Vec<AgentInstance> {
        let agents = self.agents.read().await;
        let mut found: Vec<AgentInstance> = agents
            .values()
            .filter(|a| {
                a.runtime.state.is_schedulable()
                    && a.runtime.active_tasks < a.config.max_concurrency
                    && match tags {
                        Some(tags) if !tags.is_empty() => {
                            a.config.tags.iter().any(|t| tags.contains(t))
                        }
                        _ => true,
                    }
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        found
    }

    /// Atomically claim one slot of an agent's concurrency budget.
    ///
    /// Increments `active_tasks`, derives the new lifecycle state, and emits
    /// `agent:state-changed` when the state moved.
    pub async fn record_task_start(&self, id: &str) -> Result<(), RegistryError> {
        let event;
        {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if !instance.runtime.state.is_schedulable() {
                return Err(RegistryError::AgentBusy {
                    id: id.to_string(),
                    active_tasks: instance.runtime.active_tasks,
                });
            }
            if instance.runtime.active_tasks >= instance.config.max_concurrency {
                return Err(RegistryError::AtCapacity {
                    id: id.to_string(),
                    max_concurrency: instance.config.max_concurrency,
                });
            }
            let previous = instance.runtime.state;
            instance.runtime.active_tasks += 1;
            instance.runtime.last_activity_at = Utc::now();
            let next = derived_state(instance.runtime.active_tasks, instance.config.max_concurrency);
            instance.runtime.state = next;
            event = (previous != next).then(|| ManagerEvent::AgentStateChanged {
                agent_id: id.to_string(),
                previous: previous.as_str().to_string(),
                next: next.as_str().to_string(),
                error: None,
            });
        }
        if let Some(event) = event {
            self.bus.emit(&event);
        }
        Ok(())
    }

    /// Release a concurrency slot and fold the call's accounting into the
    /// agent's counters.
    pub async fn record_task_complete(
        &self,
        id: &str,
        tokens: u64,
        cost: f64,
        success: bool,
        premium_requests: u64,
    ) -> Result<(), RegistryError> {
        let event;
        {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let runtime = &mut instance.runtime;
            let previous = runtime.state;
            runtime.active_tasks = runtime.active_tasks.saturating_sub(1);
            if success {
                runtime.tasks_completed += 1;
            } else {
                runtime.tasks_failed += 1;
            }
            runtime.total_tokens_used += tokens;
            runtime.cost_accumulated += cost;
            runtime.premium_requests += premium_requests;
            runtime.last_activity_at = Utc::now();
            // Stopped/error are sticky; only schedulable agents re-derive.
            let next = if previous.is_schedulable() {
                derived_state(runtime.active_tasks, instance.config.max_concurrency)
            } else {
                previous
            };
            runtime.state = next;
            event = (previous != next).then(|| ManagerEvent::AgentStateChanged {
                agent_id: id.to_string(),
                previous: previous.as_str().to_string(),
                next: next.as_str().to_string(),
                error: None,
            });
        }
        if let Some(event) = event {
            self.bus.emit(&event);
        }
        Ok(())
    }

    /// Force a lifecycle state (stop, error, or explicit clear back to idle).
    pub async fn set_state(
        &self,
        id: &str,
        state: AgentState,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let event;
        {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let previous = instance.runtime.state;
            instance.runtime.state = state;
            instance.runtime.error = error.clone();
            instance.runtime.last_activity_at = Utc::now();
            event = (previous != state).then(|| ManagerEvent::AgentStateChanged {
                agent_id: id.to_string(),
                previous: previous.as_str().to_string(),
                next: state.as_str().to_string(),
                error,
            });
        }
        if let Some(event) = event {
            self.bus.emit(&event);
        }
        Ok(())
    }

    /// Force-stop every agent (shutdown path; ignores the active-task guard).
    pub async fn stop_all(&self) -> usize {
        let mut events = Vec::new();
        let stopped;
        {
            let mut agents = self.agents.write().await;
            stopped = agents.len();
            for (id, instance) in agents.iter_mut() {
                let previous = instance.runtime.state;
                if previous != AgentState::Stopped {
                    instance.runtime.state = AgentState::Stopped;
                    events.push(ManagerEvent::AgentStateChanged {
                        agent_id: id.clone(),
                        previous: previous.as_str().to_string(),
                        next: AgentState::Stopped.as_str().to_string(),
                        error: None,
                    });
                }
            }
        }
        for event in &events {
            self.bus.emit(event);
        }
        stopped
    }

    pub async fn get_health(&self, id: &str) -> Result<AgentHealth, RegistryError> {
        let agents = self.agents.read().await;
        let instance = agents
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(AgentHealth {
            agent_id: instance.config.id.clone(),
            state: instance.runtime.state,
            active_tasks: instance.runtime.active_tasks,
            max_concurrency: instance.config.max_concurrency,
            tasks_completed: instance.runtime.tasks_completed,
            tasks_failed: instance.runtime.tasks_failed,
            total_tokens_used: instance.runtime.total_tokens_used,
            cost_accumulated: instance.runtime.cost_accumulated,
            last_activity_at: instance.runtime.last_activity_at,
            error: instance.runtime.error.clone(),
        })
    }

    /// Merge externally edited configs into the live registry.
    ///
    /// Known ids keep their runtime with the new config; new ids enter idle;
    /// ids absent from disk are removed only when they have no active tasks.
    /// A wipe-to-empty while memory is non-empty is refused.
    pub async fn reload_from_disk(&self) {
        let configs: Vec<AgentConfig> = match self.catalog.load() {
            Ok((configs, _)) => configs,
            Err(e) => {
                log::error!("AgentRegistry: hot reload failed to read catalog: {}", e);
                return;
            }
        };
        let mut events = Vec::new();
        {
            let mut agents = self.agents.write().await;
            if configs.is_empty() && !agents.is_empty() {
                log::warn!(
                    "AgentRegistry: external wipe of agents.json ignored ({} live agent(s))",
                    agents.len()
                );
                return;
            }
            let incoming: HashMap<String, AgentConfig> =
                configs.into_iter().map(|c| (c.id.clone(), c)).collect();

            // Remove agents that vanished from disk, unless mid-task.
            let stale: Vec<String> = agents
                .keys()
                .filter(|id| !incoming.contains_key(*id))
                .cloned()
                .collect();
            for id in stale {
                let active = agents
                    .get(&id)
                    .map(|a| a.runtime.active_tasks)
                    .unwrap_or(0);
                if active == 0 {
                    agents.remove(&id);
                    events.push(ManagerEvent::AgentUnregistered { agent_id: id });
                } else {
                    log::warn!(
                        "AgentRegistry: '{}' missing on disk but has {} active task(s), keeping",
                        id,
                        active
                    );
                }
            }
            // Merge configs, preserving runtime for known ids.
            for (id, config) in incoming {
                match agents.get_mut(&id) {
                    Some(existing) => existing.config = config,
                    None => {
                        events.push(ManagerEvent::AgentRegistered {
                            agent_id: config.id.clone(),
                            name: config.name.clone(),
                            provider: config.provider.as_str().to_string(),
                        });
                        agents.insert(
                            id,
                            AgentInstance {
                                config,
                                runtime: AgentRuntime::fresh(),
                            },
                        );
                    }
                }
            }
        }
        for event in &events {
            self.bus.emit(event);
        }
    }

    /// Arm the hot-reload watcher on the catalog file.
    pub fn arm_watcher(&self) -> Result<(), notify::Error> {
        let registry = self.self_weak.clone();
        let watcher = ConfigWatcher::watch(self.catalog.path(), move || {
            if let Some(registry) = registry.upgrade() {
                tokio::spawn(async move {
                    registry.reload_from_disk().await;
                });
            }
        })?;
        *self.watcher.lock().unwrap() = Some(watcher);
        Ok(())
    }

    /// Stop the hot-reload watcher (shutdown).
    pub fn disarm_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.close();
        }
    }

    fn configs_of(agents: &HashMap<String, AgentInstance>) -> Vec<AgentConfig> {
        let mut configs: Vec<AgentConfig> = agents.values().map(|a| a.config.clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    fn persist(&self, configs: Vec<AgentConfig>) {
        if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
            watcher.mark_self_write();
        }
        if let Err(e) = self.catalog.save(&configs) {
            log::error!("AgentRegistry: failed to persist catalog: {}", e);
        }
        if let Some(side) = &self.side {
            let side = Arc::clone(side);
            let value = serde_json::to_value(&configs).unwrap_or_default();
            tokio::spawn(async move {
                if let Err(e) = side.store(KEY_AGENTS, &value).await {
                    log::warn!("AgentRegistry: side-channel push failed: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_config(id: &str, tags: &[&str], max_concurrency: u32) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            name: format!("Agent {}", id),
            provider: ProviderKind::OpenAi,
            model: "test-model".to_string(),
            transport: Transport::Http,
            endpoint: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            can_mutate: false,
            cost_multiplier: 1.0,
            max_concurrency,
            timeout_ms: None,
            binary_path: None,
            cli_args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            session: false,
        }
    }

    fn registry(dir: &std::path::Path) -> Arc<AgentRegistry> {
        AgentRegistry::new(dir.join("agents.json"), Arc::new(EventBus::new()), None)
    }

    #[tokio::test]
    async fn register_preserves_runtime_on_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.register(test_config("a", &["code"], 2)).await.unwrap();
        registry.record_task_start("a").await.unwrap();
        registry
            .record_task_complete("a", 100, 0.5, true, 0)
            .await
            .unwrap();

        let mut replacement = test_config("a", &["review"], 2);
        replacement.model = "newer-model".to_string();
        registry.register(replacement).await.unwrap();

        let instance = registry.get("a").await.unwrap();
        assert_eq!(instance.config.model, "newer-model");
        assert_eq!(instance.runtime.tasks_completed, 1);
        assert_eq!(instance.runtime.total_tokens_used, 100);
    }

    #[tokio::test]
    async fn capacity_invariant_and_state_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.register(test_config("a", &[], 2)).await.unwrap();

        registry.record_task_start("a").await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().runtime.state, AgentState::Running);
        registry.record_task_start("a").await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().runtime.state, AgentState::Busy);

        // Third start exceeds max_concurrency and is refused.
        assert!(matches!(
            registry.record_task_start("a").await,
            Err(RegistryError::AtCapacity { .. })
        ));

        registry.record_task_complete("a", 10, 0.1, true, 0).await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().runtime.state, AgentState::Running);
        registry.record_task_complete("a", 10, 0.1, false, 0).await.unwrap();
        let runtime = registry.get("a").await.unwrap().runtime;
        assert_eq!(runtime.state, AgentState::Idle);
        assert_eq!(runtime.active_tasks, 0);
        assert_eq!(runtime.tasks_completed, 1);
        assert_eq!(runtime.tasks_failed, 1);
    }

    #[tokio::test]
    async fn unregister_refused_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.register(test_config("a", &[], 1)).await.unwrap();
        registry.record_task_start("a").await.unwrap();
        assert!(matches!(
            registry.unregister("a").await,
            Err(RegistryError::AgentBusy { .. })
        ));
        registry.record_task_complete("a", 0, 0.0, true, 0).await.unwrap();
        registry.unregister("a").await.unwrap();
        assert!(registry.get("a").await.is_none());
    }

    #[tokio::test]
    async fn find_by_tags_is_or_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.register(test_config("a", &["code", "review"], 1)).await.unwrap();
        registry.register(test_config("b", &["security"], 1)).await.unwrap();
        registry.register(test_config("c", &[], 1)).await.unwrap();

        let found = registry
            .find_by_tags(&["review".to_string(), "security".to_string()])
            .await;
        let ids: Vec<&str> = found.iter().map(|a| a.config.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stopped_state_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.register(test_config("a", &[], 1)).await.unwrap();
        registry
            .set_state("a", AgentState::Stopped, None)
            .await
            .unwrap();
        assert!(registry.find_available(None).await.is_empty());
        assert!(matches!(
            registry.record_task_start("a").await,
            Err(RegistryError::AgentBusy { .. })
        ));
        // Explicit clear brings it back.
        registry.set_state("a", AgentState::Idle, None).await.unwrap();
        assert_eq!(registry.find_available(None).await.len(), 1);
    }
}
