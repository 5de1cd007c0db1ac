use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agentmesh::automation::{
    AutomationEngine, ConditionKind, ExecutionStatus, ParamMapping, RetrySpec, RuleCondition,
    RuleInput, RuleMatcher, ThrottleMode, ThrottleSpec,
};
use agentmesh::bus::{EventBus, ManagerEvent};
use agentmesh::provider::{
    estimate_tokens, BillingModel, Provider, ProviderCapabilities, ProviderError, ProviderReply,
    ProviderSet,
};
use agentmesh::registry::{AgentConfig, AgentRegistry, ProviderKind, Transport};
use agentmesh::router::{Priority, Router};
use agentmesh::skills::{SkillDefinition, SkillStore, Strategy};

/// Mock provider: succeeds (or fails when told to) and records prompts.
struct MockProvider {
    fail: StdMutex<bool>,
    prompts: StdMutex<Vec<String>>,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            fail: StdMutex::new(false),
            prompts: StdMutex::new(Vec::new()),
        }
    }

    fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_token_counting: true,
            supports_streaming: false,
            billing_model: BillingModel::PerToken,
            supports_concurrency: true,
            supports_acp: false,
        }
    }

    async fn send_prompt(
        &self,
        _config: &AgentConfig,
        prompt: &str,
        _max_tokens: Option<u32>,
        _timeout_ms: u64,
    ) -> Result<ProviderReply, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if *self.fail.lock().unwrap() {
            return Err(ProviderError::Http("mock failure".to_string()));
        }
        Ok(ProviderReply {
            content: "automated answer".to_string(),
            token_count: estimate_tokens(prompt) + 4,
            token_count_estimated: false,
            latency_ms: 1,
            warning: None,
        })
    }
}

struct Harness {
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillStore>,
    engine: Arc<AutomationEngine>,
    mock: Arc<MockProvider>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let registry = AgentRegistry::new(
        dir.path().join("agents.json"),
        bus.clone(),
        None,
    );
    let skills = SkillStore::new(
        dir.path().join("skills.json"),
        bus.clone(),
        None,
    );
    let mock = Arc::new(MockProvider::new());
    let mut providers = ProviderSet::with_defaults();
    providers.insert(mock.clone());
    let router = Arc::new(Router::new(
        registry.clone(),
        skills.clone(),
        Arc::new(providers),
        bus.clone(),
        dir.path().join("task-history.jsonl"),
        dir.path().join("router-metrics.json"),
        50,
    ));
    let engine = AutomationEngine::new(
        dir.path().join("rules.json"),
        router,
        registry.clone(),
        skills.clone(),
        bus.clone(),
    );
    engine.start();

    // One agent and one skill so executions have something to route to.
    registry
        .register(AgentConfig {
            id: "worker".to_string(),
            name: "Worker".to_string(),
            provider: ProviderKind::OpenAi,
            model: "mock-model".to_string(),
            transport: Transport::Http,
            endpoint: None,
            tags: Vec::new(),
            can_mutate: false,
            cost_multiplier: 1.0,
            max_concurrency: 4,
            timeout_ms: None,
            binary_path: None,
            cli_args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            session: false,
        })
        .await
        .unwrap();
    skills
        .register(SkillDefinition {
            id: "inspect".to_string(),
            name: "Inspect".to_string(),
            description: String::new(),
            prompt_template: "Inspect {file}".to_string(),
            strategy: Strategy::Single,
            target_agents: Vec::new(),
            target_tags: Vec::new(),
            max_tokens: None,
            timeout_ms: None,
            merge_results: false,
            quality_threshold: None,
            fallback_on_empty: false,
            synthesizer_tags: Vec::new(),
            version: "1.0.0".to_string(),
            categories: Vec::new(),
        })
        .await
        .unwrap();

    Harness {
        bus,
        registry,
        skills,
        engine,
        mock,
        _dir: dir,
    }
}

fn file_changed(file: &str) -> ManagerEvent {
    ManagerEvent::WorkspaceFileChanged {
        path: "/repo".to_string(),
        file: file.to_string(),
        kind: "modify".to_string(),
    }
}

fn rule_input(matcher: RuleMatcher) -> RuleInput {
    RuleInput {
        id: Some("rule-under-test".to_string()),
        enabled: true,
        priority: Priority::Normal,
        matcher,
        skill_id: "inspect".to_string(),
        param_mapping: ParamMapping::default(),
        throttle: None,
        retry: None,
        conditions: Vec::new(),
        max_concurrent: 0,
        tags: Vec::new(),
    }
}

fn events_matcher(events: &[&str]) -> RuleMatcher {
    RuleMatcher {
        events: events.iter().map(|e| e.to_string()).collect(),
        filters: HashMap::new(),
        required_fields: Vec::new(),
    }
}

/// Poll until the engine has recorded `count` executions with the given
/// status, or fail after ~2s.
async fn wait_for_executions(
    engine: &Arc<AutomationEngine>,
    status: ExecutionStatus,
    count: usize,
) -> usize {
    for _ in 0..100 {
        let matching = engine
            .executions(None)
            .await
            .iter()
            .filter(|e| e.status == status)
            .count();
        if matching >= count {
            return matching;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine
        .executions(None)
        .await
        .iter()
        .filter(|e| e.status == status)
        .count()
}

#[tokio::test]
async fn matching_event_executes_with_resolved_params() {
    let h = harness().await;
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input
        .param_mapping
        .from_event
        .insert("file".to_string(), "file".to_string());
    h.engine.register_rule(input).await.unwrap();

    h.bus.emit(&file_changed("main.rs"));
    let fired = wait_for_executions(&h.engine, ExecutionStatus::Success, 1).await;
    assert_eq!(fired, 1);
    // The dot-path pulled the filename into the skill template.
    assert!(h.mock.prompts().iter().any(|p| p == "Inspect main.rs"));

    let execution = &h.engine.executions(None).await[0];
    assert_eq!(execution.rule_id, "rule-under-test");
    assert_eq!(execution.resolved_params["file"], "main.rs");
    assert!(execution.task_id.is_some());
}

#[tokio::test]
async fn non_matching_events_do_nothing() {
    let h = harness().await;
    let mut matcher = events_matcher(&["workspace:file-changed"]);
    matcher.filters.insert("file".to_string(), "*.rs".to_string());
    h.engine.register_rule(rule_input(matcher)).await.unwrap();

    h.bus.emit(&file_changed("notes.md"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.engine.executions(None).await.is_empty());
}

#[tokio::test]
async fn wildcard_prefix_matches_event_family() {
    let h = harness().await;
    h.engine
        .register_rule(rule_input(events_matcher(&["workspace:*"])))
        .await
        .unwrap();
    h.bus.emit(&file_changed("any.txt"));
    let fired = wait_for_executions(&h.engine, ExecutionStatus::Success, 1).await;
    assert_eq!(fired, 1);
}

#[tokio::test]
async fn leading_throttle_rejects_within_interval() {
    let h = harness().await;
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input.throttle = Some(ThrottleSpec {
        interval_ms: 600,
        mode: ThrottleMode::Leading,
        group_by: None,
    });
    h.engine.register_rule(input).await.unwrap();

    // t=0 fires, t+100ms throttled, after the interval fires again.
    h.bus.emit(&file_changed("one.rs"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.bus.emit(&file_changed("two.rs"));
    tokio::time::sleep(Duration::from_millis(700)).await;
    h.bus.emit(&file_changed("three.rs"));

    assert_eq!(wait_for_executions(&h.engine, ExecutionStatus::Success, 2).await, 2);
    assert_eq!(
        wait_for_executions(&h.engine, ExecutionStatus::Throttled, 1).await,
        1
    );
}

#[tokio::test]
async fn trailing_throttle_coalesces_to_latest_payload() {
    let h = harness().await;
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input
        .param_mapping
        .from_event
        .insert("file".to_string(), "file".to_string());
    input.throttle = Some(ThrottleSpec {
        interval_ms: 300,
        mode: ThrottleMode::Trailing,
        group_by: None,
    });
    h.engine.register_rule(input).await.unwrap();

    h.bus.emit(&file_changed("first.rs"));
    h.bus.emit(&file_changed("second.rs"));
    h.bus.emit(&file_changed("last.rs"));

    assert_eq!(wait_for_executions(&h.engine, ExecutionStatus::Success, 1).await, 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // One execution total, carrying the latest coalesced payload.
    let executions = h.engine.executions(None).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].resolved_params["file"], "last.rs");
}

#[tokio::test]
async fn failed_conditions_record_skipped() {
    let h = harness().await;
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input.conditions = vec![RuleCondition {
        kind: ConditionKind::MinAgents,
        value: json!(5),
    }];
    h.engine.register_rule(input).await.unwrap();

    h.bus.emit(&file_changed("main.rs"));
    assert_eq!(wait_for_executions(&h.engine, ExecutionStatus::Skipped, 1).await, 1);
    let execution = &h.engine.executions(None).await[0];
    assert!(execution.result_summary.as_deref().unwrap().contains("min-agents"));
}

#[tokio::test]
async fn custom_condition_always_passes() {
    let h = harness().await;
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input.conditions = vec![RuleCondition {
        kind: ConditionKind::Custom,
        value: json!("whatever"),
    }];
    h.engine.register_rule(input).await.unwrap();
    h.bus.emit(&file_changed("main.rs"));
    assert_eq!(wait_for_executions(&h.engine, ExecutionStatus::Success, 1).await, 1);
}

#[tokio::test]
async fn dry_run_trigger_resolves_params_but_skips() {
    let h = harness().await;
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input
        .param_mapping
        .from_event
        .insert("file".to_string(), "file".to_string());
    h.engine.register_rule(input).await.unwrap();

    let execution = h
        .engine
        .trigger_rule("rule-under-test", json!({ "file": "probe.rs" }), true)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Skipped);
    assert!(execution.result_summary.as_deref().unwrap().contains("[DRY RUN]"));
    assert_eq!(execution.resolved_params["file"], "probe.rs");
    // Nothing was routed.
    assert!(h.mock.prompts().is_empty());
}

#[tokio::test]
async fn retry_ladder_records_each_attempt() {
    let h = harness().await;
    h.mock.set_fail(true);
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input.retry = Some(RetrySpec {
        max_retries: 1,
        base_delay_ms: 50,
        max_delay_ms: 200,
    });
    h.engine.register_rule(input).await.unwrap();

    h.bus.emit(&file_changed("main.rs"));
    assert_eq!(wait_for_executions(&h.engine, ExecutionStatus::Failed, 2).await, 2);
    let executions = h.engine.executions(None).await;
    let mut attempts: Vec<u32> = executions.iter().map(|e| e.retry_attempt).collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![0, 1]);
}

#[tokio::test]
async fn disabled_engine_ignores_events_but_allows_trigger() {
    let h = harness().await;
    h.engine
        .register_rule(rule_input(events_matcher(&["workspace:file-changed"])))
        .await
        .unwrap();
    h.engine.set_enabled(false);

    h.bus.emit(&file_changed("main.rs"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.engine.executions(None).await.is_empty());

    let execution = h
        .engine
        .trigger_rule("rule-under-test", json!({ "file": "x.rs" }), false)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn update_rule_bumps_patch_version() {
    let h = harness().await;
    let rule = h
        .engine
        .register_rule(rule_input(events_matcher(&["workspace:file-changed"])))
        .await
        .unwrap();
    assert_eq!(rule.version, "1.0.0");
    h.engine
        .set_rule_enabled("rule-under-test", false)
        .await
        .unwrap();
    let updated = h.engine.get_rule("rule-under-test").await.unwrap();
    assert_eq!(updated.version, "1.0.1");
    assert!(!updated.enabled);
}

#[tokio::test]
async fn skills_are_checked_by_skill_exists_condition() {
    let h = harness().await;
    let mut input = rule_input(events_matcher(&["workspace:file-changed"]));
    input.conditions = vec![RuleCondition {
        kind: ConditionKind::SkillExists,
        value: json!("no-such-skill"),
    }];
    h.engine.register_rule(input).await.unwrap();
    h.bus.emit(&file_changed("main.rs"));
    assert_eq!(wait_for_executions(&h.engine, ExecutionStatus::Skipped, 1).await, 1);
    // Sanity: the skill store itself is intact.
    assert!(h.skills.get("inspect").await.is_some());
    let _ = &h.registry;
}
