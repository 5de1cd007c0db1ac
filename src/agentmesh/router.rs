//! Task router: fans a single request out to candidate agents under one of
//! seven execution disciplines and aggregates the responses.
//!
//! # Strategies
//!
//! - **single**: least-loaded candidate answers alone
//! - **race**: all candidates at once, first success wins
//! - **fan-out**: all candidates at once, every settlement returned
//! - **consensus**: fan-out, then a synthesizer agent merges the successes
//! - **fallback**: cheapest first, serially, until a substantive success
//! - **cost-optimized**: cheapest first, serially, until a response scores
//!   above the skill's quality threshold
//! - **evaluate**: a doer answers, a critic reviews the answer
//!
//! # Routing pipeline
//!
//! ```text
//! route(request)
//!   ├─ resolve skill ─ resolve prompt ─ compute candidate set
//!   ├─ emit task:started
//!   ├─ execute strategy (per-agent calls may run in parallel)
//!   ├─ per-agent counters via AgentRegistry::record_task_complete
//!   ├─ global metrics + bounded history ring (persisted)
//!   └─ emit task:completed
//! ```
//!
//! A provider failure never aborts the task; it becomes a failed
//! [`AgentResponse`] and the task as a whole succeeds iff at least one
//! response succeeded.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

use crate::agentmesh::bus::{EventBus, ManagerEvent};
use crate::agentmesh::persist::{read_json, write_json, JsonlLog};
use crate::agentmesh::provider::{BillingModel, ProviderSet, DEFAULT_TIMEOUT_MS};
use crate::agentmesh::registry::{AgentInstance, AgentRegistry};
use crate::agentmesh::skills::{SkillDefinition, SkillStore, Strategy};

/// Per-request timeout for the race strategy when the skill sets none.
const RACE_DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Minimum non-whitespace characters for a fallback success to count as
/// substantive when `fallback_on_empty` is set.
const SUBSTANTIVE_MIN_CHARS: usize = 20;

/// Characters of final content kept in a history entry.
const HISTORY_PREVIEW_CHARS: usize = 200;

/// Task priority, shared with automation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// One request into [`Router::route`].
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: String,
    pub skill_id: String,
    pub params: HashMap<String, String>,
    /// Pre-resolved prompt; skips template resolution when set.
    pub resolved_prompt: Option<String>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl TaskRequest {
    pub fn new(skill_id: impl Into<String>, params: HashMap<String, String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            skill_id: skill_id.into(),
            params,
            resolved_prompt: None,
            priority: Priority::Normal,
            created_at: Utc::now(),
        }
    }
}

/// One agent's answer (or failure) within a routed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent_id: String,
    pub model: String,
    pub content: String,
    pub token_count: u64,
    pub token_count_estimated: bool,
    pub latency_ms: u64,
    pub cost_units: f64,
    pub premium_requests: u64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated outcome of one routed task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub skill_id: String,
    pub strategy: Strategy,
    pub responses: Vec<AgentResponse>,
    pub final_content: String,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

/// Bounded-ring record of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub skill_id: String,
    pub strategy: Strategy,
    pub success: bool,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub agent_ids: Vec<String>,
    pub content_preview: String,
    #[serde(default)]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Global counters accumulated across every routed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterMetrics {
    pub total_tasks: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_premium_requests: u64,
    pub total_estimated_tokens: u64,
}

/// Errors surfaced by [`Router::route`].
#[derive(Debug)]
pub enum RouterError {
    UnknownSkill(String),
    NoAvailableAgents,
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::UnknownSkill(id) => write!(f, "unknown skill '{}'", id),
            RouterError::NoAvailableAgents => write!(f, "no available agents for task"),
        }
    }
}

impl Error for RouterError {}

/// The strategy engine.
pub struct Router {
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillStore>,
    providers: Arc<ProviderSet>,
    bus: Arc<EventBus>,
    metrics: Mutex<RouterMetrics>,
    history: Mutex<VecDeque<TaskHistoryEntry>>,
    history_log: JsonlLog,
    metrics_path: PathBuf,
    history_limit: usize,
}

impl Router {
    pub fn new(
        registry: Arc<AgentRegistry>,
        skills: Arc<SkillStore>,
        providers: Arc<ProviderSet>,
        bus: Arc<EventBus>,
        history_path: impl Into<PathBuf>,
        metrics_path: impl Into<PathBuf>,
        history_limit: usize,
    ) -> Self {
        let metrics_path = metrics_path.into();
        let history_log = JsonlLog::new(history_path);

        // Both metrics and the history ring survive restarts.
        let metrics = read_json::<RouterMetrics>(&metrics_path)
            .ok()
            .flatten()
            .unwrap_or_default();
        let mut history: VecDeque<TaskHistoryEntry> = VecDeque::new();
        if let Ok(entries) = history_log.load::<TaskHistoryEntry, _>(|e| e.task_id.clone()) {
            for entry in entries.into_iter().rev().take(history_limit) {
                history.push_back(entry);
            }
        }

        Self {
            registry,
            skills,
            providers,
            bus,
            metrics: Mutex::new(metrics),
            history: Mutex::new(history),
            history_log,
            metrics_path,
            history_limit,
        }
    }

    /// Route one task end to end.
    pub async fn route(&self, request: TaskRequest) -> Result<TaskResult, RouterError> {
        let skill = self
            .skills
            .get(&request.skill_id)
            .await
            .ok_or_else(|| RouterError::UnknownSkill(request.skill_id.clone()))?;
        let prompt = request
            .resolved_prompt
            .clone()
            .unwrap_or_else(|| SkillStore::resolve_prompt(&skill, &request.params));

        let candidates = self.candidates(&skill).await;
        if candidates.is_empty() {
            return Err(RouterError::NoAvailableAgents);
        }
        let candidate_ids: Vec<String> =
            candidates.iter().map(|c| c.config.id.clone()).collect();

        self.bus.emit(&ManagerEvent::TaskStarted {
            task_id: request.task_id.clone(),
            skill_id: skill.id.clone(),
            strategy: skill.strategy.as_str().to_string(),
            agent_ids: candidate_ids.clone(),
        });

        let started = Instant::now();
        let (responses, final_content) = match skill.strategy {
            Strategy::Single => self.run_single(&skill, &prompt, candidates).await,
            Strategy::Race => self.run_race(&skill, &prompt, candidates).await,
            Strategy::FanOut => self.run_fan_out(&skill, &prompt, candidates).await,
            Strategy::Consensus => self.run_consensus(&skill, &prompt, candidates).await,
            Strategy::Fallback => self.run_fallback(&skill, &prompt, candidates).await,
            Strategy::CostOptimized => self.run_cost_optimized(&skill, &prompt, candidates).await,
            Strategy::Evaluate => self.run_evaluate(&skill, &prompt, candidates).await,
        };

        let total_latency_ms = started.elapsed().as_millis() as u64;
        let success = responses.iter().any(|r| r.success);
        let total_tokens: u64 = responses.iter().map(|r| r.token_count).sum();
        let total_cost: f64 = responses.iter().map(|r| r.cost_units).sum();
        let result = TaskResult {
            task_id: request.task_id.clone(),
            skill_id: skill.id.clone(),
            strategy: skill.strategy,
            final_content,
            total_tokens,
            total_cost,
            total_latency_ms,
            success,
            completed_at: Utc::now(),
            responses,
        };

        self.record(&result).await;

        self.bus.emit(&ManagerEvent::TaskCompleted {
            task_id: result.task_id.clone(),
            skill_id: result.skill_id.clone(),
            strategy: result.strategy.as_str().to_string(),
            success: result.success,
            total_tokens: result.total_tokens,
            total_cost: result.total_cost,
            duration_ms: total_latency_ms,
        });

        Ok(result)
    }

    /// Candidate derivation: explicit ids, else tag matches, else every
    /// available agent — always filtered to schedulable-below-capacity.
    async fn candidates(&self, skill: &SkillDefinition) -> Vec<AgentInstance> {
        if !skill.target_agents.is_empty() {
            let mut found = Vec::new();
            for id in &skill.target_agents {
                if let Some(instance) = self.registry.get(id).await {
                    let schedulable = instance.runtime.state.is_schedulable()
                        && instance.runtime.active_tasks < instance.config.max_concurrency;
                    if schedulable {
                        found.push(instance);
                    }
                }
            }
            return found;
        }
        if !skill.target_tags.is_empty() {
            return self.registry.find_available(Some(&skill.target_tags)).await;
        }
        self.registry.find_available(None).await
    }

    fn timeout_for(&self, skill: &SkillDefinition, instance: &AgentInstance) -> u64 {
        skill
            .timeout_ms
            .or(instance.config.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// One agent call with full registry bookkeeping, folded into an
    /// [`AgentResponse`] whether the provider succeeded or not.
    fn invoke(
        &self,
        instance: AgentInstance,
        prompt: String,
        max_tokens: Option<u32>,
        timeout_ms: u64,
    ) -> impl std::future::Future<Output = AgentResponse> + Send + 'static {
        let registry = Arc::clone(&self.registry);
        let providers = Arc::clone(&self.providers);
        invoke_agent(registry, providers, instance, prompt, max_tokens, timeout_ms)
    }

    async fn run_single(
        &self,
        skill: &SkillDefinition,
        prompt: &str,
        mut candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        sort_by_load(&mut candidates);
        let chosen = candidates.remove(0);
        let timeout_ms = self.timeout_for(skill, &chosen);
        let response = self
            .invoke(chosen, prompt.to_string(), skill.max_tokens, timeout_ms)
            .await;
        let final_content = response.content.clone();
        (vec![response], final_content)
    }

    async fn run_race(
        &self,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let timeout_ms = skill.timeout_ms.unwrap_or(RACE_DEFAULT_TIMEOUT_MS);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for instance in candidates {
            let tx = tx.clone();
            let call = self.invoke(instance, prompt.to_string(), skill.max_tokens, timeout_ms);
            tokio::spawn(async move {
                let _ = tx.send(call.await);
            });
        }
        drop(tx);

        // First success wins. Losing calls run to completion in the
        // background so capacity accounting stays balanced; their responses
        // are discarded.
        let mut failures = Vec::new();
        while let Some(response) = rx.recv().await {
            if response.success {
                let final_content = response.content.clone();
                return (vec![response], final_content);
            }
            failures.push(response);
        }
        (failures, String::new())
    }

    async fn run_fan_out(
        &self,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let calls = candidates.into_iter().map(|instance| {
            let timeout_ms = self.timeout_for(skill, &instance);
            self.invoke(instance, prompt.to_string(), skill.max_tokens, timeout_ms)
        });
        let responses: Vec<AgentResponse> = join_all(calls).await;
        let final_content = merge_final_content(&responses, skill.merge_results);
        (responses, final_content)
    }

    /// Fan-out plus a synthesis pass.
    ///
    /// The synthesis call goes through the same provider contract but is not
    /// recorded as a separate routed task: its tokens and cost land on the
    /// synthesized response inside this task's result.
    async fn run_consensus(
        &self,
        skill: &SkillDefinition,
        prompt: &str,
        candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let (mut responses, plain) = self.run_fan_out(skill, prompt, candidates).await;
        let count = responses.iter().filter(|r| r.success).count();
        if count < 2 {
            return (responses, plain);
        }

        let synthesis_prompt = {
            let successes: Vec<&AgentResponse> =
                responses.iter().filter(|r| r.success).collect();
            build_synthesis_prompt(prompt, &successes)
        };
        let synthesizer = match self.pick_synthesizer(&skill.synthesizer_tags).await {
            Some(instance) => instance,
            None => return (responses, plain),
        };
        let timeout_ms = self.timeout_for(skill, &synthesizer);
        let mut synthesized = self
            .invoke(synthesizer, synthesis_prompt, skill.max_tokens, timeout_ms)
            .await;
        if !synthesized.success {
            log::warn!(
                "Router: consensus synthesis via '{}' failed: {:?}",
                synthesized.agent_id,
                synthesized.error
            );
            return (responses, plain);
        }
        synthesized.content = format!(
            "[Consensus from {} agents, synthesized by {}]\n{}",
            count, synthesized.agent_id, synthesized.content
        );
        let final_content = synthesized.content.clone();
        responses.insert(0, synthesized);
        (responses, final_content)
    }

    /// Synthesizer preference: available agent carrying a synthesizer tag,
    /// else the least-loaded available agent.
    async fn pick_synthesizer(&self, synthesizer_tags: &[String]) -> Option<AgentInstance> {
        if !synthesizer_tags.is_empty() {
            let mut tagged = self.registry.find_available(Some(synthesizer_tags)).await;
            sort_by_load(&mut tagged);
            if let Some(first) = tagged.into_iter().next() {
                return Some(first);
            }
        }
        let mut all = self.registry.find_available(None).await;
        sort_by_load(&mut all);
        all.into_iter().next()
    }

    async fn run_fallback(
        &self,
        skill: &SkillDefinition,
        prompt: &str,
        mut candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        sort_by_cost(&mut candidates);
        let mut responses = Vec::new();
        let mut final_content = String::new();
        for instance in candidates {
            let timeout_ms = self.timeout_for(skill, &instance);
            let response = self
                .invoke(instance, prompt.to_string(), skill.max_tokens, timeout_ms)
                .await;
            let substantive = response.success
                && (!skill.fallback_on_empty || is_substantive(&response.content));
            if substantive {
                final_content = response.content.clone();
                responses.push(response);
                break;
            }
            responses.push(response);
        }
        if final_content.is_empty() {
            // Nothing substantive: fall back to the best plain success.
            if let Some(success) = responses.iter().find(|r| r.success) {
                final_content = success.content.clone();
            }
        }
        (responses, final_content)
    }

    async fn run_cost_optimized(
        &self,
        skill: &SkillDefinition,
        prompt: &str,
        mut candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        let threshold = skill.quality_threshold.unwrap_or(0.5);
        sort_by_cost(&mut candidates);
        let mut responses = Vec::new();
        let mut best: Option<(f64, String)> = None;
        for instance in candidates {
            let timeout_ms = self.timeout_for(skill, &instance);
            let response = self
                .invoke(instance, prompt.to_string(), skill.max_tokens, timeout_ms)
                .await;
            if response.success {
                let score = score_response(prompt, &response.content);
                log::debug!(
                    "Router: cost-optimized response from '{}' scored {:.2}",
                    response.agent_id,
                    score
                );
                let met = score >= threshold;
                if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                    best = Some((score, response.content.clone()));
                }
                responses.push(response);
                if met {
                    break;
                }
            } else {
                responses.push(response);
            }
        }
        let final_content = best.map(|(_, content)| content).unwrap_or_default();
        (responses, final_content)
    }

    async fn run_evaluate(
        &self,
        skill: &SkillDefinition,
        prompt: &str,
        mut candidates: Vec<AgentInstance>,
    ) -> (Vec<AgentResponse>, String) {
        if candidates.len() < 2 {
            return self.run_single(skill, prompt, candidates).await;
        }
        sort_by_load(&mut candidates);
        let doer = candidates.remove(0);
        let critic = candidates.remove(0);

        let doer_timeout = self.timeout_for(skill, &doer);
        let doer_response = self
            .invoke(doer, prompt.to_string(), skill.max_tokens, doer_timeout)
            .await;
        if !doer_response.success {
            let final_content = String::new();
            return (vec![doer_response], final_content);
        }

        let critique_prompt = build_evaluation_prompt(prompt, &doer_response.content);
        let critic_timeout = self.timeout_for(skill, &critic);
        let mut critic_response = self
            .invoke(critic, critique_prompt, skill.max_tokens, critic_timeout)
            .await;
        if !critic_response.success {
            let final_content = doer_response.content.clone();
            return (vec![doer_response, critic_response], final_content);
        }
        critic_response.content = format!(
            "--- Original answer from {} ---\n{}\n\n--- Evaluation ---\n{}",
            doer_response.agent_id, doer_response.content, critic_response.content
        );
        let final_content = critic_response.content.clone();
        (vec![critic_response, doer_response], final_content)
    }

    /// Fold a completed task into the global metrics and the history ring.
    async fn record(&self, result: &TaskResult) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.total_tasks += 1;
            metrics.total_tokens += result.total_tokens;
            metrics.total_cost += result.total_cost;
            metrics.total_premium_requests +=
                result.responses.iter().map(|r| r.premium_requests).sum::<u64>();
            metrics.total_estimated_tokens += result
                .responses
                .iter()
                .filter(|r| r.token_count_estimated)
                .map(|r| r.token_count)
                .sum::<u64>();
            if let Err(e) = write_json(&self.metrics_path, &*metrics) {
                log::error!("Router: failed to persist metrics: {}", e);
            }
        }

        let entry = TaskHistoryEntry {
            task_id: result.task_id.clone(),
            skill_id: result.skill_id.clone(),
            strategy: result.strategy,
            success: result.success,
            total_tokens: result.total_tokens,
            total_cost: result.total_cost,
            total_latency_ms: result.total_latency_ms,
            agent_ids: result.responses.iter().map(|r| r.agent_id.clone()).collect(),
            content_preview: result.final_content.chars().take(HISTORY_PREVIEW_CHARS).collect(),
            error: result
                .responses
                .iter()
                .find_map(|r| if r.success { None } else { r.error.clone() }),
            completed_at: result.completed_at,
        };
        {
            let mut history = self.history.lock().await;
            history.push_front(entry.clone());
            history.truncate(self.history_limit);
        }
        if let Err(e) = self.history_log.append(&entry) {
            log::error!("Router: failed to append task history: {}", e);
        }
    }

    /// Newest-first copy of the in-memory history ring.
    pub async fn history(&self, limit: Option<usize>) -> Vec<TaskHistoryEntry> {
        let history = self.history.lock().await;
        history
            .iter()
            .take(limit.unwrap_or(self.history_limit))
            .cloned()
            .collect()
    }

    pub async fn metrics(&self) -> RouterMetrics {
        self.metrics.lock().await.clone()
    }
}

/// The detached per-agent call: claim a slot, send the prompt, release the
/// slot with the call's accounting. Also used by the cross-repo dispatcher
/// for its agent-routed path so metrics stay unified.
pub(crate) async fn invoke_agent(
    registry: Arc<AgentRegistry>,
    providers: Arc<ProviderSet>,
    instance: AgentInstance,
    prompt: String,
    max_tokens: Option<u32>,
    timeout_ms: u64,
) -> AgentResponse {
    let config = instance.config;
    let failed = |error: String| AgentResponse {
        agent_id: config.id.clone(),
        model: config.model.clone(),
        content: String::new(),
        token_count: 0,
        token_count_estimated: false,
        latency_ms: 0,
        cost_units: 0.0,
        premium_requests: 0,
        success: false,
        error: Some(error),
        timestamp: Utc::now(),
    };

    if let Err(e) = registry.record_task_start(&config.id).await {
        return failed(e.to_string());
    }

    let provider = match providers.for_agent(&config) {
        Some(provider) => provider,
        None => {
            let _ = registry
                .record_task_complete(&config.id, 0, 0.0, false, 0)
                .await;
            return failed(format!("no provider for '{}'", config.provider));
        }
    };
    let premium_per_call =
        if provider.capabilities().billing_model == BillingModel::PremiumRequest {
            1
        } else {
            0
        };

    let outcome = provider
        .send_prompt(&config, &prompt, max_tokens, timeout_ms)
        .await;
    let response = match outcome {
        Ok(reply) => {
            let cost_units = config.cost_multiplier * (reply.token_count as f64 / 1000.0);
            AgentResponse {
                agent_id: config.id.clone(),
                model: config.model.clone(),
                content: reply.content,
                token_count: reply.token_count,
                token_count_estimated: reply.token_count_estimated,
                latency_ms: reply.latency_ms,
                cost_units,
                premium_requests: premium_per_call,
                success: true,
                error: reply.warning,
                timestamp: Utc::now(),
            }
        }
        Err(e) => failed(e.to_string()),
    };

    if let Err(e) = registry
        .record_task_complete(
            &config.id,
            response.token_count,
            response.cost_units,
            response.success,
            response.premium_requests,
        )
        .await
    {
        log::error!("Router: failed to record completion for '{}': {}", config.id, e);
    }
    response
}

fn sort_by_load(candidates: &mut [AgentInstance]) {
    candidates.sort_by(|a, b| {
        a.runtime
            .active_tasks
            .cmp(&b.runtime.active_tasks)
            .then(
                a.config
                    .cost_multiplier
                    .partial_cmp(&b.config.cost_multiplier)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.config.id.cmp(&b.config.id))
    });
}

fn sort_by_cost(candidates: &mut [AgentInstance]) {
    candidates.sort_by(|a, b| {
        a.config
            .cost_multiplier
            .partial_cmp(&b.config.cost_multiplier)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.config.id.cmp(&b.config.id))
    });
}

fn is_substantive(content: &str) -> bool {
    content.chars().filter(|c| !c.is_whitespace()).count() >= SUBSTANTIVE_MIN_CHARS
}

/// Fan-out final content: merged document when requested and more than one
/// success, else the first success.
fn merge_final_content(responses: &[AgentResponse], merge: bool) -> String {
    let successes: Vec<&AgentResponse> = responses.iter().filter(|r| r.success).collect();
    match successes.len() {
        0 => String::new(),
        1 => successes[0].content.clone(),
        _ if merge => successes
            .iter()
            .map(|r| {
                format!(
                    "--- Agent: {} ({}) [{}ms] ---\n{}",
                    r.agent_id, r.model, r.latency_ms, r.content
                )
            })
            .collect::<Vec<String>>()
            .join("\n\n"),
        _ => successes[0].content.clone(),
    }
}

fn build_synthesis_prompt(prompt: &str, successes: &[&AgentResponse]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are synthesizing {} independent responses to the same prompt.\n\n",
        successes.len()
    ));
    out.push_str(&format!("Original prompt:\n{}\n\n", prompt));
    for response in successes {
        out.push_str(&format!(
            "--- Response from {} ({}) ---\n{}\n\n",
            response.agent_id, response.model, response.content
        ));
    }
    out.push_str(
        "Provide:\n\
         1. Points of agreement\n\
         2. Points of disagreement\n\
         3. A synthesized answer\n\
         4. Confidence (low/medium/high)",
    );
    out
}

fn build_evaluation_prompt(prompt: &str, answer: &str) -> String {
    format!(
        "You are reviewing another agent's answer.\n\n\
         Original prompt:\n{}\n\n\
         Answer under review:\n{}\n\n\
         Provide:\n\
         1. Quality score (1-10)\n\
         2. Issues found\n\
         3. Suggested improvements\n\
         4. A revised answer",
        prompt, answer
    )
}

lazy_static::lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do",
        "for", "from", "has", "have", "how", "if", "in", "is", "it", "its",
        "of", "on", "or", "that", "the", "this", "to", "was", "what", "when",
        "where", "which", "who", "why", "will", "with", "you", "your",
    ]
    .into_iter()
    .collect();

    static ref ERROR_PATTERN: regex::Regex =
        regex::Regex::new(r"(?i)error|sorry|cannot|unable|don't know|i'm not sure").unwrap();
}

/// Heuristic response quality score in `[0, 1]`, used by the
/// cost-optimized strategy.
///
/// Components: non-empty plus length proportional to the prompt (<= 0.4),
/// keyword overlap with the prompt (<= 0.3, stop words removed, first 30
/// keywords), structural markers (<= 0.2), and absence of refusal/error
/// phrasing (<= 0.1).
pub fn score_response(prompt: &str, content: &str) -> f64 {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let mut score = 0.2;

    let prompt_words = prompt.split_whitespace().count().max(1);
    let content_words = trimmed.split_whitespace().count();
    score += 0.2 * (content_words as f64 / prompt_words as f64).min(1.0);

    let keywords: Vec<String> = {
        let mut seen = HashSet::new();
        prompt
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w.as_str()))
            .filter(|w| seen.insert(w.clone()))
            .take(30)
            .collect()
    };
    if !keywords.is_empty() {
        let lower = trimmed.to_lowercase();
        let matched = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
        score += 0.3 * (matched as f64 / keywords.len() as f64);
    }

    let mut structure = 0.0;
    if trimmed.contains("```") {
        structure += 0.05;
    }
    if trimmed.lines().any(|l| l.trim_start().starts_with('#')) {
        structure += 0.05;
    }
    if trimmed.lines().any(|l| {
        let l = l.trim_start();
        l.starts_with("- ") || l.starts_with("* ") || l.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
    }) {
        structure += 0.05;
    }
    if trimmed.contains('\n') {
        structure += 0.05;
    }
    score += structure;

    if !ERROR_PATTERN.is_match(trimmed) {
        score += 0.1;
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_scores_zero() {
        assert_eq!(score_response("explain rust ownership", "   "), 0.0);
    }

    #[test]
    fn refusal_scores_low() {
        let score = score_response("explain rust ownership semantics", "error: no idea");
        assert!(score < 0.5, "refusal scored {}", score);
    }

    #[test]
    fn structured_relevant_answer_scores_high() {
        let prompt = "explain rust ownership semantics and borrowing";
        let content = "Ownership in Rust means each value has a single owner.\n\n\
                       # Borrowing\n\
                       - shared references allow reads\n\
                       - mutable references are exclusive\n\n\
                       ```rust\nlet s = String::new();\n```\n\
                       Ownership and borrowing together prevent data races in rust programs \
                       by checking reference lifetimes at compile time.";
        let score = score_response(prompt, content);
        assert!(score >= 0.5, "good answer scored {}", score);
    }

    #[test]
    fn substantive_threshold_counts_non_whitespace() {
        assert!(!is_substantive("ok"));
        assert!(!is_substantive("   a b c   "));
        assert!(is_substantive("a reasonably detailed response here"));
    }

    #[test]
    fn merge_layout_contains_agent_headers() {
        let response = |id: &str, content: &str| AgentResponse {
            agent_id: id.to_string(),
            model: "m".to_string(),
            content: content.to_string(),
            token_count: 1,
            token_count_estimated: false,
            latency_ms: 5,
            cost_units: 0.0,
            premium_requests: 0,
            success: true,
            error: None,
            timestamp: Utc::now(),
        };
        let merged = merge_final_content(&[response("a", "alpha"), response("b", "beta")], true);
        assert!(merged.contains("--- Agent: a (m) [5ms] ---"));
        assert!(merged.contains("--- Agent: b (m) [5ms] ---"));
        assert!(merged.contains("alpha"));
        assert!(merged.contains("beta"));
    }
}
