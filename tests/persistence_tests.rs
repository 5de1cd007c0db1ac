use std::collections::HashMap;
use std::sync::Arc;

use agentmesh::bus::EventBus;
use agentmesh::registry::{AgentConfig, AgentRegistry, ProviderKind, Transport};

fn agent(id: &str) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        name: format!("Agent {}", id),
        provider: ProviderKind::Anthropic,
        model: "test-model".to_string(),
        transport: Transport::Http,
        endpoint: None,
        tags: vec!["test".to_string()],
        can_mutate: false,
        cost_multiplier: 1.0,
        max_concurrency: 2,
        timeout_ms: None,
        binary_path: None,
        cli_args: Vec::new(),
        env: HashMap::new(),
        cwd: None,
        session: false,
    }
}

fn registry(dir: &std::path::Path) -> Arc<AgentRegistry> {
    AgentRegistry::new(
        dir.join("agents.json"),
        Arc::new(EventBus::new()),
        None,
    )
}

#[tokio::test]
async fn catalog_round_trips_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    {
        let registry = registry(dir.path());
        for id in ["a", "b", "c"] {
            registry.register(agent(id)).await.unwrap();
        }
    }
    let reloaded = registry(dir.path());
    assert_eq!(reloaded.load().await.unwrap(), 3);
    let mut ids: Vec<String> = reloaded
        .get_all()
        .await
        .iter()
        .map(|a| a.config.id.clone())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn wiping_the_catalog_leaves_a_recoverable_shadow() {
    let dir = tempfile::tempdir().unwrap();

    // Process A seeds three entries, then persists an empty set in one
    // write (the shadow protocol snapshots the full catalog).
    {
        let registry = registry(dir.path());
        for id in ["a", "b", "c"] {
            registry.register(agent(id)).await.unwrap();
        }
    }
    agentmesh::persist::CatalogFile::new(dir.path().join("agents.json"))
        .save::<AgentConfig>(&[])
        .unwrap();
    let primary = std::fs::read_to_string(dir.path().join("agents.json")).unwrap();
    assert_eq!(primary.trim(), "[]");
    let shadow = std::fs::read_to_string(dir.path().join("agents.json.bak")).unwrap();
    assert!(shadow.contains("\"a\""));

    // Process B starts cold: the shadow heals the wipe and the primary is
    // re-persisted from it.
    let cold = registry(dir.path());
    assert_eq!(cold.load().await.unwrap(), 3);
    let healed = std::fs::read_to_string(dir.path().join("agents.json")).unwrap();
    assert!(healed.contains("\"c\""));
}

#[tokio::test]
async fn corrupt_primary_heals_from_shadow() {
    let dir = tempfile::tempdir().unwrap();
    {
        let registry = registry(dir.path());
        registry.register(agent("a")).await.unwrap();
        registry.register(agent("b")).await.unwrap();
    }
    std::fs::copy(
        dir.path().join("agents.json"),
        dir.path().join("agents.json.bak"),
    )
    .unwrap();
    std::fs::write(dir.path().join("agents.json"), "{definitely not json").unwrap();

    let cold = registry(dir.path());
    assert_eq!(cold.load().await.unwrap(), 2);
}

#[tokio::test]
async fn missing_primary_restores_from_shadow() {
    let dir = tempfile::tempdir().unwrap();
    {
        let registry = registry(dir.path());
        registry.register(agent("only")).await.unwrap();
    }
    std::fs::rename(
        dir.path().join("agents.json"),
        dir.path().join("agents.json.bak"),
    )
    .unwrap();

    let cold = registry(dir.path());
    assert_eq!(cold.load().await.unwrap(), 1);
    assert!(dir.path().join("agents.json").exists());
}

#[tokio::test]
async fn hot_reload_merges_and_protects_busy_agents() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(agent("keep")).await.unwrap();
    registry.register(agent("busy")).await.unwrap();
    registry.register(agent("drop")).await.unwrap();
    registry.record_task_start("busy").await.unwrap();
    // Accumulate runtime on "keep" to verify it survives the reload.
    registry.record_task_start("keep").await.unwrap();
    registry
        .record_task_complete("keep", 42, 0.1, true, 0)
        .await
        .unwrap();

    // External edit: "drop" and "busy" vanish, "fresh" appears, "keep" gets
    // a new model.
    let mut keep = agent("keep");
    keep.model = "edited-model".to_string();
    let on_disk = vec![keep, agent("fresh")];
    std::fs::write(
        dir.path().join("agents.json"),
        serde_json::to_string_pretty(&on_disk).unwrap(),
    )
    .unwrap();
    registry.reload_from_disk().await;

    // keep: new config, old runtime. fresh: enters idle. drop: removed.
    // busy: survives because it has an active task.
    let keep = registry.get("keep").await.unwrap();
    assert_eq!(keep.config.model, "edited-model");
    assert_eq!(keep.runtime.tasks_completed, 1);
    assert_eq!(keep.runtime.total_tokens_used, 42);
    assert!(registry.get("fresh").await.is_some());
    assert!(registry.get("drop").await.is_none());
    assert!(registry.get("busy").await.is_some());
}

#[tokio::test]
async fn external_wipe_to_empty_is_refused_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(agent("a")).await.unwrap();

    std::fs::write(dir.path().join("agents.json"), "[]").unwrap();
    // The .bak shadow is also empty here, so the load sees a true wipe.
    registry.reload_from_disk().await;
    assert!(registry.get("a").await.is_some(), "live registry kept its agent");
}
