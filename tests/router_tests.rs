use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use agentmesh::bus::EventBus;
use agentmesh::provider::{
    estimate_tokens, BillingModel, Provider, ProviderCapabilities, ProviderError, ProviderReply,
    ProviderSet,
};
use agentmesh::registry::{AgentConfig, AgentRegistry, ProviderKind, Transport};
use agentmesh::router::{Router, RouterError, TaskRequest};
use agentmesh::skills::{SkillDefinition, SkillStore, Strategy};

/// Scripted reply for one agent id.
#[derive(Clone)]
struct MockReply {
    content: String,
    fail: bool,
    delay_ms: u64,
}

/// Test double standing in for the openai HTTP provider. Records the
/// invocation order and the prompt each agent received.
struct MockProvider {
    replies: StdMutex<HashMap<String, MockReply>>,
    calls: StdMutex<Vec<String>>,
    prompts: StdMutex<HashMap<String, String>>,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            replies: StdMutex::new(HashMap::new()),
            calls: StdMutex::new(Vec::new()),
            prompts: StdMutex::new(HashMap::new()),
        }
    }

    fn reply(&self, agent_id: &str, content: &str) {
        self.replies.lock().unwrap().insert(
            agent_id.to_string(),
            MockReply {
                content: content.to_string(),
                fail: false,
                delay_ms: 0,
            },
        );
    }

    fn failure(&self, agent_id: &str) {
        self.replies.lock().unwrap().insert(
            agent_id.to_string(),
            MockReply {
                content: String::new(),
                fail: true,
                delay_ms: 0,
            },
        );
    }

    fn slow_reply(&self, agent_id: &str, content: &str, delay_ms: u64) {
        self.replies.lock().unwrap().insert(
            agent_id.to_string(),
            MockReply {
                content: content.to_string(),
                fail: false,
                delay_ms,
            },
        );
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn prompt_for(&self, agent_id: &str) -> Option<String> {
        self.prompts.lock().unwrap().get(agent_id).cloned()
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
        config: &AgentConfig,
        prompt: &str,
        _max_tokens: Option<u32>,
        _timeout_ms: u64,
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.lock().unwrap().push(config.id.clone());
        self.prompts
            .lock()
            .unwrap()
            .insert(config.id.clone(), prompt.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&config.id)
            .cloned()
            .unwrap_or(MockReply {
                content: format!("default reply from {}", config.id),
                fail: false,
                delay_ms: 0,
            });
        if reply.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(reply.delay_ms)).await;
        }
        if reply.fail {
            return Err(ProviderError::Http("mock failure".to_string()));
        }
        Ok(ProviderReply {
            token_count: estimate_tokens(prompt) + estimate_tokens(&reply.content),
            token_count_estimated: false,
            latency_ms: reply.delay_ms,
            warning: None,
            content: reply.content,
        })
    }
}

struct Harness {
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillStore>,
    router: Arc<Router>,
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
    Harness {
        bus,
        registry,
        skills,
        router,
        mock,
        _dir: dir,
    }
}

fn agent(id: &str, tags: &[&str], cost: f64) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        name: format!("Agent {}", id),
        provider: ProviderKind::OpenAi,
        model: "mock-model".to_string(),
        transport: Transport::Http,
        endpoint: None,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        can_mutate: false,
        cost_multiplier: cost,
        max_concurrency: 4,
        timeout_ms: None,
        binary_path: None,
        cli_args: Vec::new(),
        env: HashMap::new(),
        cwd: None,
        session: false,
    }
}

fn skill(id: &str, strategy: Strategy, template: &str) -> SkillDefinition {
    SkillDefinition {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        prompt_template: template.to_string(),
        strategy,
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
    }
}

fn params(key: &str, value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert(key.to_string(), value.to_string());
    params
}

#[tokio::test]
async fn single_strategy_picks_the_tag_match() {
    let h = harness().await;
    h.registry.register(agent("a", &["code", "review"], 1.0)).await.unwrap();
    h.registry.register(agent("b", &["security"], 1.0)).await.unwrap();
    h.mock.reply("a", "looks fine to me");

    let mut s = skill("s", Strategy::Single, "Review: {code}");
    s.target_tags = vec!["review".to_string()];
    h.skills.register(s).await.unwrap();

    let result = h
        .router
        .route(TaskRequest::new("s", params("code", "x=1")))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.responses.len(), 1);
    assert_eq!(result.responses[0].agent_id, "a");
    assert!(result.total_tokens > 0);
    assert_eq!(h.mock.prompt_for("a").unwrap(), "Review: x=1");
    assert!(h.mock.prompt_for("b").is_none());
}

#[tokio::test]
async fn race_returns_exactly_one_success() {
    let h = harness().await;
    for id in ["r1", "r2", "r3"] {
        h.registry.register(agent(id, &[], 1.0)).await.unwrap();
    }
    h.mock.failure("r1");
    h.mock.failure("r2");
    h.mock.slow_reply("r3", "the winning answer", 50);

    h.skills
        .register(skill("race", Strategy::Race, "{question}"))
        .await
        .unwrap();

    let result = h
        .router
        .route(TaskRequest::new("race", params("question", "who wins?")))
        .await
        .unwrap();
    assert!(result.success);
    let successes: Vec<_> = result.responses.iter().filter(|r| r.success).collect();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].agent_id, "r3");
    assert_eq!(result.final_content, "the winning answer");
}

#[tokio::test]
async fn race_with_all_failures_returns_the_failures() {
    let h = harness().await;
    for id in ["r1", "r2"] {
        h.registry.register(agent(id, &[], 1.0)).await.unwrap();
        h.mock.failure(id);
    }
    h.skills
        .register(skill("race", Strategy::Race, "{question}"))
        .await
        .unwrap();

    let result = h
        .router
        .route(TaskRequest::new("race", params("question", "?")))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.responses.len(), 2);
}

#[tokio::test]
async fn fan_out_returns_all_and_merges() {
    let h = harness().await;
    for id in ["f1", "f2", "f3"] {
        h.registry.register(agent(id, &[], 1.0)).await.unwrap();
        h.mock.reply(id, &format!("view from {}", id));
    }
    let mut s = skill("wide", Strategy::FanOut, "{question}");
    s.merge_results = true;
    h.skills.register(s).await.unwrap();

    let result = h
        .router
        .route(TaskRequest::new("wide", params("question", "opinions?")))
        .await
        .unwrap();
    assert_eq!(result.responses.len(), 3);
    for id in ["f1", "f2", "f3"] {
        assert!(
            result.final_content.contains(&format!("--- Agent: {} (mock-model)", id)),
            "merged content missing {}",
            id
        );
        assert!(result.final_content.contains(&format!("view from {}", id)));
    }
}

#[tokio::test]
async fn consensus_synthesizes_and_puts_synthesis_first() {
    let h = harness().await;
    for id in ["c1", "c2", "c3"] {
        h.registry.register(agent(id, &["panel"], 1.0)).await.unwrap();
        h.mock.reply(id, &format!("position of {}", id));
    }
    h.registry
        .register(agent("synth", &["synthesizer"], 1.0))
        .await
        .unwrap();
    h.mock.reply("synth", "the merged view");

    let mut s = skill("agree", Strategy::Consensus, "{question}");
    s.target_tags = vec!["panel".to_string()];
    s.synthesizer_tags = vec!["synthesizer".to_string()];
    h.skills.register(s).await.unwrap();

    let result = h
        .router
        .route(TaskRequest::new("agree", params("question", "direction?")))
        .await
        .unwrap();

    assert_eq!(result.responses.len(), 4);
    let synthesized = &result.responses[0];
    assert_eq!(synthesized.agent_id, "synth");
    assert!(synthesized
        .content
        .starts_with("[Consensus from 3 agents, synthesized by synth]"));
    assert_eq!(result.final_content, synthesized.content);
    // The synthesis prompt embeds every panel response verbatim.
    let synthesis_prompt = h.mock.prompt_for("synth").unwrap();
    for id in ["c1", "c2", "c3"] {
        assert!(synthesis_prompt.contains(&format!("position of {}", id)));
    }
    assert!(synthesis_prompt.contains("Points of agreement"));
}

#[tokio::test]
async fn fallback_skips_thin_successes_when_guarded() {
    let h = harness().await;
    h.registry.register(agent("cheap", &[], 0.3)).await.unwrap();
    h.registry.register(agent("pricey", &[], 1.0)).await.unwrap();
    h.mock.reply("cheap", "ok");
    let long_answer = "a substantially longer answer that carries real content".repeat(2);
    h.mock.reply("pricey", &long_answer);

    let mut s = skill("fall", Strategy::Fallback, "{question}");
    s.fallback_on_empty = true;
    h.skills.register(s).await.unwrap();

    let result = h
        .router
        .route(TaskRequest::new("fall", params("question", "expand?")))
        .await
        .unwrap();

    assert_eq!(h.mock.calls(), vec!["cheap", "pricey"]);
    assert_eq!(result.responses.len(), 2);
    assert_eq!(result.final_content, long_answer);
}

#[tokio::test]
async fn fallback_without_guard_stops_at_first_success() {
    let h = harness().await;
    h.registry.register(agent("cheap", &[], 0.3)).await.unwrap();
    h.registry.register(agent("pricey", &[], 1.0)).await.unwrap();
    h.mock.reply("cheap", "ok");

    h.skills
        .register(skill("fall", Strategy::Fallback, "{question}"))
        .await
        .unwrap();
    let result = h
        .router
        .route(TaskRequest::new("fall", params("question", "?")))
        .await
        .unwrap();
    assert_eq!(h.mock.calls(), vec!["cheap"]);
    assert_eq!(result.final_content, "ok");
}

#[tokio::test]
async fn cost_optimized_escalates_past_low_quality() {
    let h = harness().await;
    h.registry.register(agent("c", &[], 0.3)).await.unwrap();
    h.registry.register(agent("d", &[], 1.0)).await.unwrap();
    h.mock.reply("c", "error: no idea");
    let good = "Ownership in Rust means each value has one owner.\n\n\
                # Borrowing\n\
                - shared references allow reads\n\
                - mutable references are exclusive\n\n\
                ```rust\nlet s = String::new();\n```\n\
                Ownership and borrowing prevent data races in rust programs.";
    h.mock.reply("d", good);

    let mut s = skill("quality", Strategy::CostOptimized, "{question}");
    s.quality_threshold = Some(0.5);
    h.skills.register(s).await.unwrap();

    let result = h
        .router
        .route(TaskRequest::new(
            "quality",
            params("question", "explain rust ownership semantics and borrowing"),
        ))
        .await
        .unwrap();

    assert_eq!(h.mock.calls(), vec!["c", "d"]);
    assert_eq!(result.responses.len(), 2);
    assert_eq!(result.responses[0].agent_id, "c");
    assert_eq!(result.responses[1].agent_id, "d");
    assert_eq!(result.final_content, good);
}

#[tokio::test]
async fn evaluate_runs_doer_then_critic() {
    let h = harness().await;
    h.registry.register(agent("doer", &[], 0.5)).await.unwrap();
    h.registry.register(agent("critic", &[], 1.0)).await.unwrap();
    h.mock.reply("doer", "draft answer");
    h.mock.reply("critic", "8/10, tighten the intro");

    h.skills
        .register(skill("review", Strategy::Evaluate, "{question}"))
        .await
        .unwrap();
    let result = h
        .router
        .route(TaskRequest::new("review", params("question", "draft?")))
        .await
        .unwrap();

    assert_eq!(h.mock.calls(), vec!["doer", "critic"]);
    assert_eq!(result.responses.len(), 2);
    // Critic first, with the doer's answer prepended for context.
    assert_eq!(result.responses[0].agent_id, "critic");
    assert!(result.responses[0].content.contains("draft answer"));
    assert!(result.responses[0].content.contains("--- Evaluation ---"));
    assert_eq!(result.responses[1].agent_id, "doer");
    // The critic was shown the evaluation rubric.
    let critic_prompt = h.mock.prompt_for("critic").unwrap();
    assert!(critic_prompt.contains("Quality score (1-10)"));
    assert!(critic_prompt.contains("draft answer"));
}

#[tokio::test]
async fn task_events_fire_exactly_once_per_route() {
    let h = harness().await;
    h.registry.register(agent("a", &[], 1.0)).await.unwrap();
    h.skills
        .register(skill("s", Strategy::Single, "{question}"))
        .await
        .unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    {
        let started = started.clone();
        h.bus.on("task:started", move |_| {
            started.fetch_add(1, Ordering::SeqCst);
        });
        let completed = completed.clone();
        h.bus.on("task:completed", move |_| {
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }

    h.router
        .route(TaskRequest::new("s", params("question", "?")))
        .await
        .unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn routing_errors_are_typed() {
    let h = harness().await;
    let err = h
        .router
        .route(TaskRequest::new("nope", HashMap::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownSkill(_)));

    h.skills
        .register(skill("s", Strategy::Single, "{q}"))
        .await
        .unwrap();
    let err = h
        .router
        .route(TaskRequest::new("s", HashMap::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::NoAvailableAgents));
}

#[tokio::test]
async fn metrics_and_history_accumulate() {
    let h = harness().await;
    h.registry.register(agent("a", &[], 1.0)).await.unwrap();
    h.skills
        .register(skill("s", Strategy::Single, "{q}"))
        .await
        .unwrap();

    for i in 0..3 {
        h.router
            .route(TaskRequest::new("s", params("q", &format!("call {}", i))))
            .await
            .unwrap();
    }

    let metrics = h.router.metrics().await;
    assert_eq!(metrics.total_tasks, 3);
    assert!(metrics.total_tokens > 0);

    let history = h.router.history(None).await;
    assert_eq!(history.len(), 3);
    // Newest first.
    assert!(history[0].completed_at >= history[2].completed_at);
    let agent_counters = h.registry.get("a").await.unwrap().runtime;
    assert_eq!(agent_counters.tasks_completed, 3);
    assert_eq!(agent_counters.active_tasks, 0);
}
