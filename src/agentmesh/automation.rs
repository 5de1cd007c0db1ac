//! Automation engine: declarative rules that fire skills from observed
//! events.
//!
//! Every bus event flows through a single intake queue and is evaluated
//! against all enabled rules (priority order) before the next event is
//! consumed. Matching is name-based with `prefix:*` wildcards, plus
//! required-field presence and per-field filters (equality, glob `*`, or
//! regex). A match then passes through throttling, runtime conditions, and
//! a per-rule concurrency gate before its parameters are resolved and the
//! skill is routed.
//!
//! ```text
//! EventBus ──► intake queue ──► match ─ throttle ─ conditions ─ gate
//!                                   │ (evaluation is serial per event)
//!                                   ▼
//!                           resolve params ──► spawn execute ──► Router
//!                                                   │ retry ladder on failure
//!                                                   ▼
//!                                          AutomationExecution + stats
//! ```
//!
//! Executions overlap freely; only the evaluation pipeline is serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

use crate::agentmesh::bus::EventBus;
use crate::agentmesh::persist::{CatalogFile, PersistError};
use crate::agentmesh::registry::AgentRegistry;
use crate::agentmesh::router::{Priority, Router, TaskRequest};
use crate::agentmesh::skills::SkillStore;
use crate::agentmesh::watcher::ConfigWatcher;

/// Recent executions kept in memory.
const EXECUTIONS_KEPT: usize = 200;

/// Characters of a task's final content kept in a result summary.
const SUMMARY_CHARS: usize = 200;

/// Event matcher of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatcher {
    /// Event names; a trailing `*` makes an entry a prefix wildcard
    /// (`"workspace:*"`).
    pub events: Vec<String>,
    /// Field (dot-path) → pattern. Equality, glob `*`, or regex.
    #[serde(default)]
    pub filters: HashMap<String, String>,
    /// Dot-paths that must be present in the payload.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    /// Fire immediately, then reject until the interval elapses.
    Leading,
    /// Schedule at the end of a quiet window, coalescing intervening
    /// events into the scheduled payload.
    Trailing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleSpec {
    pub interval_ms: u64,
    pub mode: ThrottleMode,
    /// Event field whose value partitions the throttle window.
    #[serde(default)]
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionKind {
    /// Requires at least N agents in the registry.
    MinAgents,
    /// Requires the named skill to exist.
    SkillExists,
    /// Requires no successful execution of this rule within the last N ms.
    Cooldown,
    /// Reserved; always passes.
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub value: Value,
}

/// Parameter resolution: `static` seeds, `fromEvent` dot-path overlays,
/// then `{event.path}` template interpolation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamMapping {
    #[serde(default, rename = "static")]
    pub static_params: HashMap<String, Value>,
    #[serde(default)]
    pub from_event: HashMap<String, String>,
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

/// A declarative trigger from event patterns to a skill invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Priority,
    pub matcher: RuleMatcher,
    pub skill_id: String,
    #[serde(default)]
    pub param_mapping: ParamMapping,
    #[serde(default)]
    pub throttle: Option<ThrottleSpec>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_rule_version")]
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_rule_version() -> String {
    "1.0.0".to_string()
}

/// Caller-facing input for [`AutomationEngine::register_rule`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Priority,
    pub matcher: RuleMatcher,
    pub skill_id: String,
    #[serde(default)]
    pub param_mapping: ParamMapping,
    #[serde(default)]
    pub throttle: Option<ThrottleSpec>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update for [`AutomationEngine::update_rule`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    pub enabled: Option<bool>,
    pub priority: Option<Priority>,
    pub matcher: Option<RuleMatcher>,
    pub skill_id: Option<String>,
    pub param_mapping: Option<ParamMapping>,
    pub throttle: Option<Option<ThrottleSpec>>,
    pub retry: Option<Option<RetrySpec>>,
    pub conditions: Option<Vec<RuleCondition>>,
    pub max_concurrent: Option<u32>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Throttled,
}

/// Record of one rule firing (or being gated).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationExecution {
    pub execution_id: String,
    pub rule_id: String,
    pub skill_id: String,
    pub trigger_event: String,
    pub trigger_data: Value,
    pub resolved_params: HashMap<String, String>,
    pub status: ExecutionStatus,
    pub task_id: Option<String>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub retry_attempt: u32,
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-rule aggregate counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub skipped: u64,
    pub throttled: u64,
    pub avg_duration_ms: f64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub active_executions: u32,
}

/// Filter for [`AutomationEngine::list_rules`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFilter {
    pub enabled: Option<bool>,
    pub tag: Option<String>,
}

#[derive(Debug)]
pub enum AutomationError {
    NotFound(String),
    Persist(PersistError),
}

impl fmt::Display for AutomationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationError::NotFound(id) => write!(f, "unknown automation rule '{}'", id),
            AutomationError::Persist(e) => write!(f, "rule catalog persistence failed: {}", e),
        }
    }
}

impl Error for AutomationError {}

impl From<PersistError> for AutomationError {
    fn from(e: PersistError) -> Self {
        AutomationError::Persist(e)
    }
}

#[derive(Default)]
struct ThrottleState {
    last_fire: Option<Instant>,
    /// Trailing mode: latest coalesced payload awaiting the quiet window.
    trailing: Option<(String, Value)>,
}

/// The engine.
pub struct AutomationEngine {
    self_weak: Weak<AutomationEngine>,
    rules: RwLock<HashMap<String, AutomationRule>>,
    stats: RwLock<HashMap<String, RuleStats>>,
    executions: RwLock<VecDeque<AutomationExecution>>,
    throttles: StdMutex<HashMap<String, ThrottleState>>,
    last_success: StdMutex<HashMap<String, Instant>>,
    enabled: AtomicBool,
    router: Arc<Router>,
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillStore>,
    bus: Arc<EventBus>,
    catalog: CatalogFile,
    watcher: StdMutex<Option<ConfigWatcher>>,
}

impl AutomationEngine {
    pub fn new(
        catalog_path: impl Into<std::path::PathBuf>,
        router: Arc<Router>,
        registry: Arc<AgentRegistry>,
        skills: Arc<SkillStore>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let catalog = CatalogFile::new(catalog_path);
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            rules: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
            executions: RwLock::new(VecDeque::new()),
            throttles: StdMutex::new(HashMap::new()),
            last_success: StdMutex::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            router,
            registry,
            skills,
            bus,
            catalog,
            watcher: StdMutex::new(None),
        })
    }

    /// Load persisted rules.
    pub async fn load(&self) -> Result<usize, AutomationError> {
        let loaded: Vec<AutomationRule> = match self.catalog.load() {
            Ok((rules, _)) => rules,
            Err(e) => {
                log::error!("AutomationEngine: rule catalog unusable: {}", e);
                Vec::new()
            }
        };
        let mut rules = self.rules.write().await;
        for rule in loaded {
            rules.insert(rule.id.clone(), rule);
        }
        Ok(rules.len())
    }

    /// Subscribe to the bus and start the serial evaluation worker.
    pub fn start(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
        self.bus.on_any(move |event| {
            let _ = tx.send((event.name().to_string(), event.payload()));
        });
        let engine = self.self_weak.clone();
        tokio::spawn(async move {
            while let Some((name, payload)) = rx.recv().await {
                let Some(engine) = engine.upgrade() else { break };
                if !engine.enabled.load(Ordering::SeqCst) {
                    continue;
                }
                engine.process_event(&name, &payload).await;
            }
        });
    }

    /// Evaluate one event against all rules, in priority order.
    async fn process_event(&self, event_name: &str, payload: &Value) {
        let mut matching: Vec<AutomationRule> = {
            let rules = self.rules.read().await;
            rules
                .values()
                .filter(|r| r.enabled && rule_matches(r, event_name, payload))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        for rule in matching {
            self.handle_match(rule, event_name, payload.clone()).await;
        }
    }

    async fn handle_match(&self, rule: AutomationRule, event_name: &str, payload: Value) {
        // Throttle gate.
        if let Some(throttle) = &rule.throttle {
            let key = throttle_key(&rule, throttle, &payload);
            match throttle.mode {
                ThrottleMode::Leading => {
                    let rejected = {
                        let mut throttles = self.throttles.lock().unwrap();
                        let state = throttles.entry(key).or_default();
                        let within = state
                            .last_fire
                            .map(|t| t.elapsed() < Duration::from_millis(throttle.interval_ms))
                            .unwrap_or(false);
                        if !within {
                            state.last_fire = Some(Instant::now());
                        }
                        within
                    };
                    if rejected {
                        self.record_gated(
                            &rule,
                            event_name,
                            &payload,
                            ExecutionStatus::Throttled,
                            "throttled (leading)",
                        )
                        .await;
                        return;
                    }
                }
                ThrottleMode::Trailing => {
                    let schedule = {
                        let mut throttles = self.throttles.lock().unwrap();
                        let state = throttles.entry(key.clone()).or_default();
                        let already_pending = state.trailing.is_some();
                        // Coalesce: the scheduled firing uses the latest payload.
                        state.trailing = Some((event_name.to_string(), payload.clone()));
                        !already_pending
                    };
                    if schedule {
                        self.schedule_trailing(rule.id.clone(), key, throttle.interval_ms);
                    }
                    return;
                }
            }
        }
        self.fire(rule, event_name.to_string(), payload).await;
    }

    fn schedule_trailing(&self, rule_id: String, key: String, interval_ms: u64) {
        // Weak so a long quiet window never outlives a shut-down engine.
        let engine = self.self_weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            let engine = match engine.upgrade() {
                Some(engine) => engine,
                None => return,
            };
            let pending = {
                let mut throttles = engine.throttles.lock().unwrap();
                let state = throttles.entry(key).or_default();
                state.last_fire = Some(Instant::now());
                state.trailing.take()
            };
            let (event_name, payload) = match pending {
                Some(pending) => pending,
                None => return,
            };
            // Rule may have been edited or removed during the quiet window.
            let rule = engine.rules.read().await.get(&rule_id).cloned();
            match rule {
                Some(rule) if rule.enabled && engine.enabled.load(Ordering::SeqCst) => {
                    engine.fire(rule, event_name, payload).await;
                }
                _ => {}
            }
        });
    }

    /// Conditions, concurrency gate, parameter resolution, then a spawned
    /// execution.
    async fn fire(&self, rule: AutomationRule, event_name: String, payload: Value) {
        if let Err(reason) = self.check_conditions(&rule).await {
            self.record_gated(&rule, &event_name, &payload, ExecutionStatus::Skipped, &reason)
                .await;
            return;
        }
        if rule.max_concurrent > 0 {
            let active = self
                .stats
                .read()
                .await
                .get(&rule.id)
                .map(|s| s.active_executions)
                .unwrap_or(0);
            if active >= rule.max_concurrent {
                self.record_gated(
                    &rule,
                    &event_name,
                    &payload,
                    ExecutionStatus::Throttled,
                    "concurrency limit reached",
                )
                .await;
                return;
            }
        }
        let params = resolve_params(&rule.param_mapping, &payload);
        if let Some(engine) = self.self_weak.upgrade() {
            tokio::spawn(async move {
                engine.execute(rule, event_name, payload, params, 0).await;
            });
        }
    }

    async fn check_conditions(&self, rule: &AutomationRule) -> Result<(), String> {
        for condition in &rule.conditions {
            match condition.kind {
                ConditionKind::MinAgents => {
                    let required = condition.value.as_u64().unwrap_or(1) as usize;
                    let count = self.registry.count().await;
                    if count < required {
                        return Err(format!("min-agents: {} < {}", count, required));
                    }
                }
                ConditionKind::SkillExists => {
                    let skill_id = condition.value.as_str().unwrap_or_default();
                    if self.skills.get(skill_id).await.is_none() {
                        return Err(format!("skill-exists: '{}' missing", skill_id));
                    }
                }
                ConditionKind::Cooldown => {
                    let cooldown_ms = condition.value.as_u64().unwrap_or(0);
                    let within = self
                        .last_success
                        .lock()
                        .unwrap()
                        .get(&rule.id)
                        .map(|t| t.elapsed() < Duration::from_millis(cooldown_ms))
                        .unwrap_or(false);
                    if within {
                        return Err(format!("cooldown: fired within the last {}ms", cooldown_ms));
                    }
                }
                // Reserved in the rule schema; no implementation, always
                // passes.
                ConditionKind::Custom => {}
            }
        }
        Ok(())
    }

    /// One execution attempt, recorded whatever the outcome, with the retry
    /// ladder on failure.
    fn execute(
        self: Arc<Self>,
        rule: AutomationRule,
        event_name: String,
        payload: Value,
        params: HashMap<String, String>,
        retry_attempt: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        {
            let mut stats = self.stats.write().await;
            stats.entry(rule.id.clone()).or_default().active_executions += 1;
        }
        let started = Instant::now();
        let started_at = Utc::now();
        let mut request = TaskRequest::new(rule.skill_id.clone(), params.clone());
        request.priority = rule.priority;
        let task_id = request.task_id.clone();

        let outcome = self.router.route(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, summary, error) = match &outcome {
            Ok(result) if result.success => (
                ExecutionStatus::Success,
                Some(result.final_content.chars().take(SUMMARY_CHARS).collect()),
                None,
            ),
            Ok(result) => {
                let error = result
                    .responses
                    .iter()
                    .find_map(|r| r.error.clone())
                    .unwrap_or_else(|| "all agents failed".to_string());
                (ExecutionStatus::Failed, None, Some(error))
            }
            Err(e) => (ExecutionStatus::Failed, None, Some(e.to_string())),
        };

        if status == ExecutionStatus::Success {
            self.last_success
                .lock()
                .unwrap()
                .insert(rule.id.clone(), Instant::now());
        }

        let execution = AutomationExecution {
            execution_id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            skill_id: rule.skill_id.clone(),
            trigger_event: event_name.clone(),
            trigger_data: payload.clone(),
            resolved_params: params.clone(),
            status,
            task_id: Some(task_id),
            result_summary: summary,
            error: error.clone(),
            retry_attempt,
            duration_ms: Some(duration_ms),
            started_at,
            completed_at: Some(Utc::now()),
        };
        self.record_execution(execution, true).await;

        // Retry ladder: exponential backoff, capped, cancelled if the engine
        // is disabled or the rule is gone.
        if status == ExecutionStatus::Failed {
            if let Some(retry) = rule.retry.clone() {
                if retry_attempt < retry.max_retries {
                    let delay = retry
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(retry_attempt))
                        .min(retry.max_delay_ms);
                    log::info!(
                        "AutomationEngine: rule '{}' failed (attempt {}), retrying in {}ms",
                        rule.id,
                        retry_attempt,
                        delay
                    );
                    let engine = Arc::downgrade(&self);
                    let rule_id = rule.id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        let engine = match engine.upgrade() {
                            Some(engine) => engine,
                            None => return,
                        };
                        if !engine.enabled.load(Ordering::SeqCst) {
                            return;
                        }
                        let rule = engine.rules.read().await.get(&rule_id).cloned();
                        if let Some(rule) = rule {
                            if rule.enabled {
                                engine
                                    .clone()
                                    .execute(rule, event_name, payload, params, retry_attempt + 1)
                                    .await;
                            }
                        }
                    });
                }
            }
        }
        })
    }

    /// Record a gated (skipped/throttled) evaluation.
    async fn record_gated(
        &self,
        rule: &AutomationRule,
        event_name: &str,
        payload: &Value,
        status: ExecutionStatus,
        reason: &str,
    ) {
        let execution = AutomationExecution {
            execution_id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            skill_id: rule.skill_id.clone(),
            trigger_event: event_name.to_string(),
            trigger_data: payload.clone(),
            resolved_params: HashMap::new(),
            status,
            task_id: None,
            result_summary: Some(reason.to_string()),
            error: None,
            retry_attempt: 0,
            duration_ms: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        self.record_execution(execution, false).await;
    }

    async fn record_execution(&self, execution: AutomationExecution, was_active: bool) {
        {
            let mut stats = self.stats.write().await;
            let entry = stats.entry(execution.rule_id.clone()).or_default();
            entry.total += 1;
            match execution.status {
                ExecutionStatus::Success => entry.success += 1,
                ExecutionStatus::Failed => entry.failure += 1,
                ExecutionStatus::Skipped => entry.skipped += 1,
                ExecutionStatus::Throttled => entry.throttled += 1,
                _ => {}
            }
            if let Some(duration) = execution.duration_ms {
                let completed = (entry.success + entry.failure).max(1);
                entry.avg_duration_ms +=
                    (duration as f64 - entry.avg_duration_ms) / completed as f64;
            }
            entry.last_executed_at = Some(Utc::now());
            if was_active {
                entry.active_executions = entry.active_executions.saturating_sub(1);
            }
        }
        let mut executions = self.executions.write().await;
        executions.push_front(execution);
        executions.truncate(EXECUTIONS_KEPT);
    }

    // ── Administrative operations ────────────────────────────────────────

    pub async fn register_rule(&self, input: RuleInput) -> Result<AutomationRule, AutomationError> {
        let now = Utc::now();
        let rule = AutomationRule {
            id: input
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            enabled: input.enabled,
            priority: input.priority,
            matcher: input.matcher,
            skill_id: input.skill_id,
            param_mapping: input.param_mapping,
            throttle: input.throttle,
            retry: input.retry,
            conditions: input.conditions,
            max_concurrent: input.max_concurrent,
            tags: input.tags,
            version: default_rule_version(),
            created_at: now,
            updated_at: now,
        };
        let snapshot;
        {
            let mut rules = self.rules.write().await;
            rules.insert(rule.id.clone(), rule.clone());
            snapshot = Self::sorted(&rules);
        }
        self.persist(snapshot);
        Ok(rule)
    }

    /// Apply a partial update and bump the semver patch component.
    pub async fn update_rule(
        &self,
        id: &str,
        patch: RulePatch,
    ) -> Result<AutomationRule, AutomationError> {
        let updated;
        let snapshot;
        {
            let mut rules = self.rules.write().await;
            let rule = rules
                .get_mut(id)
                .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;
            if let Some(enabled) = patch.enabled {
                rule.enabled = enabled;
            }
            if let Some(priority) = patch.priority {
                rule.priority = priority;
            }
            if let Some(matcher) = patch.matcher {
                rule.matcher = matcher;
            }
            if let Some(skill_id) = patch.skill_id {
                rule.skill_id = skill_id;
            }
            if let Some(mapping) = patch.param_mapping {
                rule.param_mapping = mapping;
            }
            if let Some(throttle) = patch.throttle {
                rule.throttle = throttle;
            }
            if let Some(retry) = patch.retry {
                rule.retry = retry;
            }
            if let Some(conditions) = patch.conditions {
                rule.conditions = conditions;
            }
            if let Some(max_concurrent) = patch.max_concurrent {
                rule.max_concurrent = max_concurrent;
            }
            if let Some(tags) = patch.tags {
                rule.tags = tags;
            }
            rule.version = bump_patch(&rule.version);
            rule.updated_at = Utc::now();
            updated = rule.clone();
            snapshot = Self::sorted(&rules);
        }
        self.persist(snapshot);
        Ok(updated)
    }

    pub async fn remove_rule(&self, id: &str) -> Result<(), AutomationError> {
        let snapshot;
        {
            let mut rules = self.rules.write().await;
            if rules.remove(id).is_none() {
                return Err(AutomationError::NotFound(id.to_string()));
            }
            snapshot = Self::sorted(&rules);
        }
        self.persist(snapshot);
        Ok(())
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<(), AutomationError> {
        self.update_rule(
            id,
            RulePatch {
                enabled: Some(enabled),
                ..RulePatch::default()
            },
        )
        .await
        .map(|_| ())
    }

    /// Engine-wide switch. Disabled: events are dropped at the intake;
    /// explicit [`trigger_rule`](Self::trigger_rule) still works.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        log::info!(
            "AutomationEngine: {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn get_rule(&self, id: &str) -> Option<AutomationRule> {
        self.rules.read().await.get(id).cloned()
    }

    pub async fn list_rules(&self, filter: Option<RuleFilter>) -> Vec<AutomationRule> {
        let rules = self.rules.read().await;
        let mut all: Vec<AutomationRule> = rules
            .values()
            .filter(|r| match &filter {
                Some(filter) => {
                    filter.enabled.map(|e| r.enabled == e).unwrap_or(true)
                        && filter
                            .tag
                            .as_ref()
                            .map(|t| r.tags.contains(t))
                            .unwrap_or(true)
                }
                None => true,
            })
            .cloned()
            .collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        all
    }

    /// Fire a rule by hand, bypassing matching and throttling. With
    /// `dry_run`, parameters are resolved but nothing executes.
    pub async fn trigger_rule(
        &self,
        id: &str,
        test_data: Value,
        dry_run: bool,
    ) -> Result<AutomationExecution, AutomationError> {
        let rule = self
            .get_rule(id)
            .await
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;
        let event_name = rule
            .matcher
            .events
            .first()
            .cloned()
            .unwrap_or_else(|| "manual:trigger".to_string());
        let params = resolve_params(&rule.param_mapping, &test_data);

        if dry_run {
            let execution = AutomationExecution {
                execution_id: uuid::Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                skill_id: rule.skill_id.clone(),
                trigger_event: event_name,
                trigger_data: test_data,
                resolved_params: params.clone(),
                status: ExecutionStatus::Skipped,
                task_id: None,
                result_summary: Some(format!(
                    "[DRY RUN] would invoke skill '{}' with params {:?}",
                    rule.skill_id, params
                )),
                error: None,
                retry_attempt: 0,
                duration_ms: None,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
            };
            self.record_execution(execution.clone(), false).await;
            return Ok(execution);
        }

        if let Err(reason) = self.check_conditions(&rule).await {
            let execution = AutomationExecution {
                execution_id: uuid::Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                skill_id: rule.skill_id.clone(),
                trigger_event: event_name,
                trigger_data: test_data,
                resolved_params: params,
                status: ExecutionStatus::Skipped,
                task_id: None,
                result_summary: Some(reason),
                error: None,
                retry_attempt: 0,
                duration_ms: None,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
            };
            self.record_execution(execution.clone(), false).await;
            return Ok(execution);
        }

        if let Some(engine) = self.self_weak.upgrade() {
            engine
                .execute(rule.clone(), event_name, test_data, params, 0)
                .await;
        }
        let executions = self.executions.read().await;
        executions
            .iter()
            .find(|e| e.rule_id == rule.id)
            .cloned()
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))
    }

    pub async fn executions(&self, limit: Option<usize>) -> Vec<AutomationExecution> {
        let executions = self.executions.read().await;
        executions
            .iter()
            .take(limit.unwrap_or(EXECUTIONS_KEPT))
            .cloned()
            .collect()
    }

    pub async fn get_status(&self) -> Value {
        let rules = self.rules.read().await;
        let stats = self.stats.read().await;
        let rule_status: Vec<Value> = {
            let mut sorted: Vec<&AutomationRule> = rules.values().collect();
            sorted.sort_by(|a, b| a.id.cmp(&b.id));
            sorted
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "enabled": r.enabled,
                        "priority": r.priority,
                        "skillId": r.skill_id,
                        "stats": stats.get(&r.id).cloned().unwrap_or_default(),
                    })
                })
                .collect()
        };
        serde_json::json!({
            "enabled": self.is_enabled(),
            "ruleCount": rules.len(),
            "rules": rule_status,
        })
    }

    pub async fn rule_stats(&self) -> HashMap<String, RuleStats> {
        self.stats.read().await.clone()
    }

    /// Replace the in-memory rule set after an external file edit. Stats
    /// and throttle state survive for surviving rule ids.
    pub async fn reload_from_disk(&self) {
        let loaded: Vec<AutomationRule> = match self.catalog.load() {
            Ok((rules, _)) => rules,
            Err(e) => {
                log::error!("AutomationEngine: hot reload failed: {}", e);
                return;
            }
        };
        let mut rules = self.rules.write().await;
        if loaded.is_empty() && !rules.is_empty() {
            log::warn!(
                "AutomationEngine: external wipe of rules.json ignored ({} live rule(s))",
                rules.len()
            );
            return;
        }
        rules.clear();
        for rule in loaded {
            rules.insert(rule.id.clone(), rule);
        }
    }

    pub fn arm_watcher(&self) -> Result<(), notify::Error> {
        let engine = self.self_weak.clone();
        let watcher = ConfigWatcher::watch(self.catalog.path(), move || {
            if let Some(engine) = engine.upgrade() {
                tokio::spawn(async move {
                    engine.reload_from_disk().await;
                });
            }
        })?;
        *self.watcher.lock().unwrap() = Some(watcher);
        Ok(())
    }

    pub fn disarm_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.close();
        }
    }

    fn sorted(rules: &HashMap<String, AutomationRule>) -> Vec<AutomationRule> {
        let mut all: Vec<AutomationRule> = rules.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn persist(&self, rules: Vec<AutomationRule>) {
        if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
            watcher.mark_self_write();
        }
        if let Err(e) = self.catalog.save(&rules) {
            log::error!("AutomationEngine: failed to persist rules: {}", e);
        }
    }
}

// ── Matching helpers ─────────────────────────────────────────────────────

/// Does `rule` match this event?
pub fn rule_matches(rule: &AutomationRule, event_name: &str, payload: &Value) -> bool {
    if !event_name_matches(&rule.matcher.events, event_name) {
        return false;
    }
    for field in &rule.matcher.required_fields {
        if dot_path(payload, field).is_none() {
            return false;
        }
    }
    for (field, pattern) in &rule.matcher.filters {
        let actual = match dot_path(payload, field) {
            Some(value) => value_to_string(value),
            None => return false,
        };
        if !pattern_matches(pattern, &actual) {
            return false;
        }
    }
    true
}

fn event_name_matches(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => p == name,
    })
}

/// Equality, then glob `*`, then regex.
fn pattern_matches(pattern: &str, actual: &str) -> bool {
    if pattern == actual {
        return true;
    }
    if pattern.contains('*') {
        let escaped = regex::escape(pattern).replace(r"\*", ".*");
        return regex::Regex::new(&format!("^{}$", escaped))
            .map(|re| re.is_match(actual))
            .unwrap_or(false);
    }
    regex::Regex::new(pattern)
        .map(|re| re.is_match(actual))
        .unwrap_or(false)
}

/// Traverse a dot-path (`"agent.id"`) through a JSON payload.
fn dot_path<'v>(payload: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

lazy_static::lazy_static! {
    static ref TEMPLATE_RE: regex::Regex =
        regex::Regex::new(r"\{event\.([A-Za-z0-9_.\-]+)\}").unwrap();
}

/// `static` seeds → `fromEvent` overlays → `{event.path}` templates.
pub fn resolve_params(mapping: &ParamMapping, payload: &Value) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = mapping
        .static_params
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect();
    for (key, path) in &mapping.from_event {
        let value = dot_path(payload, path)
            .map(value_to_string)
            .unwrap_or_default();
        params.insert(key.clone(), value);
    }
    for (key, template) in &mapping.templates {
        let rendered = TEMPLATE_RE
            .replace_all(template, |caps: &regex::Captures<'_>| {
                dot_path(payload, &caps[1])
                    .map(value_to_string)
                    .unwrap_or_default()
            })
            .into_owned();
        params.insert(key.clone(), rendered);
    }
    params
}

fn throttle_key(rule: &AutomationRule, throttle: &ThrottleSpec, payload: &Value) -> String {
    match &throttle.group_by {
        Some(field) => {
            let group = dot_path(payload, field)
                .map(value_to_string)
                .unwrap_or_default();
            format!("{}::{}", rule.id, group)
        }
        None => rule.id.clone(),
    }
}

fn bump_patch(version: &str) -> String {
    let mut parts: Vec<u64> = version
        .split('.')
        .map(|p| p.parse().unwrap_or(0))
        .collect();
    while parts.len() < 3 {
        parts.push(0);
    }
    parts[2] += 1;
    format!("{}.{}.{}", parts[0], parts[1], parts[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule_with_matcher(matcher: RuleMatcher) -> AutomationRule {
        AutomationRule {
            id: "r1".into(),
            enabled: true,
            priority: Priority::Normal,
            matcher,
            skill_id: "s1".into(),
            param_mapping: ParamMapping::default(),
            throttle: None,
            retry: None,
            conditions: Vec::new(),
            max_concurrent: 0,
            tags: Vec::new(),
            version: "1.0.0".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn event_name_wildcards() {
        let rule = rule_with_matcher(RuleMatcher {
            events: vec!["workspace:*".into(), "task:completed".into()],
            filters: HashMap::new(),
            required_fields: Vec::new(),
        });
        assert!(rule_matches(&rule, "workspace:file-changed", &json!({})));
        assert!(rule_matches(&rule, "task:completed", &json!({})));
        assert!(!rule_matches(&rule, "task:started", &json!({})));
    }

    #[test]
    fn required_fields_and_filters() {
        let mut filters = HashMap::new();
        filters.insert("file".to_string(), "*.rs".to_string());
        let rule = rule_with_matcher(RuleMatcher {
            events: vec!["workspace:file-changed".into()],
            filters,
            required_fields: vec!["path".into()],
        });
        let payload = json!({ "path": "/repo", "file": "main.rs" });
        assert!(rule_matches(&rule, "workspace:file-changed", &payload));
        // Missing required field.
        assert!(!rule_matches(
            &rule,
            "workspace:file-changed",
            &json!({ "file": "main.rs" })
        ));
        // Filter mismatch.
        assert!(!rule_matches(
            &rule,
            "workspace:file-changed",
            &json!({ "path": "/repo", "file": "main.py" })
        ));
    }

    #[test]
    fn filter_regex_and_equality() {
        assert!(pattern_matches("main.rs", "main.rs"));
        assert!(pattern_matches("^agent-[0-9]+$", "agent-42"));
        assert!(!pattern_matches("^agent-[0-9]+$", "agent-x"));
        assert!(pattern_matches("src/*.rs", "src/lib.rs"));
        assert!(!pattern_matches("src/*.rs", "tests/lib.rs"));
    }

    #[test]
    fn param_resolution_order() {
        let mut mapping = ParamMapping::default();
        mapping
            .static_params
            .insert("mode".into(), json!("review"));
        mapping
            .static_params
            .insert("file".into(), json!("static-loses"));
        mapping.from_event.insert("file".into(), "file".into());
        mapping.from_event.insert("missing".into(), "no.such.path".into());
        mapping.templates.insert(
            "summary".into(),
            "changed {event.file} under {event.path}".into(),
        );

        let payload = json!({ "file": "main.rs", "path": "/repo" });
        let params = resolve_params(&mapping, &payload);
        assert_eq!(params["mode"], "review");
        assert_eq!(params["file"], "main.rs");
        assert_eq!(params["missing"], "");
        assert_eq!(params["summary"], "changed main.rs under /repo");
    }

    #[test]
    fn semver_patch_bump() {
        assert_eq!(bump_patch("1.0.0"), "1.0.1");
        assert_eq!(bump_patch("2.3"), "2.3.1");
        assert_eq!(bump_patch("junk"), "0.0.1");
    }

    #[test]
    fn dot_paths_traverse_nested_objects() {
        let payload = json!({ "agent": { "id": "a1", "load": 3 } });
        assert_eq!(value_to_string(dot_path(&payload, "agent.id").unwrap()), "a1");
        assert_eq!(value_to_string(dot_path(&payload, "agent.load").unwrap()), "3");
        assert!(dot_path(&payload, "agent.missing").is_none());
    }
}
