use std::collections::HashMap;
use std::sync::Arc;

use agentmesh::bus::EventBus;
use agentmesh::skills::{SkillDefinition, SkillStore, Strategy};

fn store(dir: &std::path::Path) -> Arc<SkillStore> {
    SkillStore::new(
        dir.join("skills.json"),
        Arc::new(EventBus::new()),
        None,
    )
}

fn skill(id: &str, categories: &[&str]) -> SkillDefinition {
    SkillDefinition {
        id: id.to_string(),
        name: id.replace('-', " "),
        description: format!("the {} skill", id),
        prompt_template: "{input}".to_string(),
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
        categories: categories.iter().map(|c| c.to_string()).collect(),
    }
}

#[tokio::test]
async fn empty_catalog_seeds_the_default_skills() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let seeded = store.load().await.unwrap();
    assert_eq!(seeded, 9);
    for id in ["ask-multiple", "code-review", "fast-answer", "security-audit"] {
        assert!(store.get(id).await.is_some(), "missing default skill {}", id);
    }
    // Second boot does not duplicate: the catalog is no longer empty.
    let again = store.load().await.unwrap();
    assert_eq!(again, 9);
}

#[tokio::test]
async fn non_empty_catalog_is_not_reseeded() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store(dir.path());
        store.register(skill("mine", &["custom"])).await.unwrap();
    }
    let reloaded = store(dir.path());
    assert_eq!(reloaded.load().await.unwrap(), 1);
    assert!(reloaded.get("ask-multiple").await.is_none());
}

#[tokio::test]
async fn list_filters_by_category_and_search_by_keyword() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.register(skill("review-prs", &["review"])).await.unwrap();
    store.register(skill("audit-deps", &["security"])).await.unwrap();
    store.register(skill("summarize", &[])).await.unwrap();

    assert_eq!(store.list(None).await.len(), 3);
    let security = store.list(Some("security")).await;
    assert_eq!(security.len(), 1);
    assert_eq!(security[0].id, "audit-deps");

    let hits = store.search("audit").await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "audit-deps");
    assert!(store.search("nothing matches this").await.is_empty());
}

#[tokio::test]
async fn resolve_prompt_is_literal_and_keeps_unknown_placeholders() {
    let mut definition = skill("templated", &[]);
    definition.prompt_template = "Review {code} for {concern}".to_string();
    let mut params = HashMap::new();
    params.insert("code".to_string(), "fn main() {}".to_string());
    let resolved = SkillStore::resolve_prompt(&definition, &params);
    assert_eq!(resolved, "Review fn main() {} for {concern}");
}

#[tokio::test]
async fn remove_persists_and_errors_on_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.register(skill("gone-soon", &[])).await.unwrap();
    store.remove("gone-soon").await.unwrap();
    assert!(store.remove("gone-soon").await.is_err());
    assert!(store.get("gone-soon").await.is_none());
}

#[tokio::test]
async fn external_wipe_is_refused_by_hot_reload() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store.register(skill("sticky", &[])).await.unwrap();

    std::fs::write(dir.path().join("skills.json"), "[]").unwrap();
    store.reload_from_disk().await;
    assert!(store.get("sticky").await.is_some());
}
