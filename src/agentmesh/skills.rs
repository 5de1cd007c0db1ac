//! Skill store: named prompt templates with routing strategies.
//!
//! A skill couples a prompt template (`"Review this code: {code}"`) with a
//! [`Strategy`] and a targeting policy (explicit agent ids or tag
//! intersection). The router resolves a skill's template against call
//! parameters and fans the resulting prompt out per the strategy.
//!
//! The catalog is dual-written: to `skills/skills.json` on disk and, when a
//! side channel is configured, to the `mgr:skills:all` key so a fresh host
//! directory can recover the catalog after losing both the primary file and
//! its shadow.
//!
//! A small set of general-purpose default skills is seeded the first time
//! the manager boots with an empty catalog.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::RwLock;

use crate::agentmesh::bus::{EventBus, ManagerEvent};
use crate::agentmesh::persist::{CatalogFile, PersistError};
use crate::agentmesh::sidechannel::{IndexClient, KEY_SKILLS};
use crate::agentmesh::watcher::ConfigWatcher;

/// Execution discipline the router applies to a skill's candidate agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// One agent: fewest active tasks, ties broken by lowest cost.
    Single,
    /// All candidates concurrently; first success wins.
    Race,
    /// All candidates concurrently; every settlement is returned.
    FanOut,
    /// Fan-out, then a synthesizer agent merges the successful responses.
    Consensus,
    /// Cheapest first, serially, until one substantive success.
    Fallback,
    /// Cheapest first, serially, until a response scores above the quality
    /// threshold.
    CostOptimized,
    /// Doer/critic pair: the second agent reviews the first one's answer.
    Evaluate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Single => "single",
            Strategy::Race => "race",
            Strategy::FanOut => "fan-out",
            Strategy::Consensus => "consensus",
            Strategy::Fallback => "fallback",
            Strategy::CostOptimized => "cost-optimized",
            Strategy::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named prompt template plus its routing contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Template with literal `{name}` placeholders.
    pub prompt_template: String,
    pub strategy: Strategy,
    /// Explicit candidate agent ids. Takes precedence over `target_tags`.
    #[serde(default)]
    pub target_agents: Vec<String>,
    /// Tag-based candidate selection; any agent carrying any listed tag.
    #[serde(default)]
    pub target_tags: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Fan-out only: concatenate successful responses into one document.
    #[serde(default)]
    pub merge_results: bool,
    /// Cost-optimized only: minimum response score, default 0.5.
    #[serde(default)]
    pub quality_threshold: Option<f64>,
    /// Fallback only: treat sub-20-character successes as failures.
    #[serde(default)]
    pub fallback_on_empty: bool,
    /// Consensus only: preferred tags for the synthesizer agent.
    #[serde(default)]
    pub synthesizer_tags: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Errors surfaced by skill-store operations.
#[derive(Debug)]
pub enum SkillError {
    NotFound(String),
    Persist(PersistError),
}

impl fmt::Display for SkillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillError::NotFound(id) => write!(f, "unknown skill '{}'", id),
            SkillError::Persist(e) => write!(f, "skill catalog persistence failed: {}", e),
        }
    }
}

impl Error for SkillError {}

impl From<PersistError> for SkillError {
    fn from(e: PersistError) -> Self {
        SkillError::Persist(e)
    }
}

lazy_static::lazy_static! {
    /// Skills seeded into an empty catalog at first boot.
    static ref DEFAULT_SKILLS: Vec<SkillDefinition> = vec![
        seed("ask-multiple", "Ask Multiple", Strategy::FanOut,
             "{question}",
             "Ask every available agent the same question and collect all answers.",
             |s| s.merge_results = true),
        seed("consensus-check", "Consensus Check", Strategy::Consensus,
             "{question}",
             "Fan a question out and synthesize agreement and disagreement.",
             |_| {}),
        seed("code-review", "Code Review", Strategy::FanOut,
             "Review the following code. Point out bugs, risky patterns, and concrete improvements.\n\n{code}",
             "Parallel code review across review-tagged agents.",
             |s| { s.target_tags = vec!["code".into(), "review".into()]; s.merge_results = true; }),
        seed("fast-answer", "Fast Answer", Strategy::Race,
             "{question}",
             "Race all agents; the first successful answer wins.",
             |_| {}),
        seed("cost-optimized", "Cost Optimized Answer", Strategy::CostOptimized,
             "{question}",
             "Try the cheapest agents first and escalate while quality is low.",
             |s| s.quality_threshold = Some(0.5)),
        seed("security-audit", "Security Audit", Strategy::FanOut,
             "Audit the following code for security issues. Flag injection, auth, and data-exposure risks.\n\n{code}",
             "Security-focused review on security-tagged agents.",
             |s| { s.target_tags = vec!["security".into()]; s.merge_results = true; }),
        seed("explain-code", "Explain Code", Strategy::Single,
             "Explain what the following code does, step by step.\n\n{code}",
             "Single-agent code explanation.",
             |_| {}),
        seed("commit-review", "Commit Review", Strategy::Evaluate,
             "Review this commit diff for correctness and style.\n\n{diff}",
             "Doer drafts the review, a critic refines it.",
             |s| s.target_tags = vec!["code".into(), "review".into()]),
        seed("refactor-suggest", "Refactor Suggestions", Strategy::Fallback,
             "Suggest refactorings for the following code. Be specific.\n\n{code}",
             "Cheapest capable agent answers; escalate on empty output.",
             |s| s.fallback_on_empty = true),
    ];
}

fn seed(
    id: &str,
    name: &str,
    strategy: Strategy,
    template: &str,
    description: &str,
    tweak: fn(&mut SkillDefinition),
) -> SkillDefinition {
    let mut skill = SkillDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
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
        version: default_version(),
        categories: vec!["builtin".to_string()],
    };
    tweak(&mut skill);
    skill
}

/// Catalog of skills.
pub struct SkillStore {
    self_weak: Weak<SkillStore>,
    skills: RwLock<HashMap<String, SkillDefinition>>,
    bus: Arc<EventBus>,
    catalog: CatalogFile,
    side: Option<Arc<IndexClient>>,
    watcher: StdMutex<Option<ConfigWatcher>>,
}

impl SkillStore {
    pub fn new(
        catalog_path: impl Into<std::path::PathBuf>,
        bus: Arc<EventBus>,
        side: Option<Arc<IndexClient>>,
    ) -> Arc<Self> {
        let catalog = CatalogFile::new(catalog_path);
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            skills: RwLock::new(HashMap::new()),
            bus,
            catalog,
            side,
            watcher: StdMutex::new(None),
        })
    }

    /// Load the catalog (recovery ladder included) and seed the default
    /// skills when nothing could be loaded.
    pub async fn load(&self) -> Result<usize, SkillError> {
        let mut loaded: Vec<SkillDefinition> = match self.catalog.load() {
            Ok((skills, _)) => skills,
            Err(err) => {
                log::error!("SkillStore: on-disk catalog unusable: {}", err);
                self.recover_from_side_channel().await
            }
        };
        if loaded.is_empty() {
            log::info!(
                "SkillStore: empty catalog, seeding {} default skill(s)",
                DEFAULT_SKILLS.len()
            );
            loaded = DEFAULT_SKILLS.clone();
            self.catalog.save(&loaded)?;
        }
        let mut skills = self.skills.write().await;
        for skill in loaded {
            skills.insert(skill.id.clone(), skill);
        }
        Ok(skills.len())
    }

    async fn recover_from_side_channel(&self) -> Vec<SkillDefinition> {
        let side = match &self.side {
            Some(side) => side,
            None => return Vec::new(),
        };
        match side.fetch(KEY_SKILLS).await {
            Ok(Some(value)) => {
                let skills: Vec<SkillDefinition> =
                    serde_json::from_value(value).unwrap_or_default();
                log::warn!("SkillStore: recovered {} skill(s) from side channel", skills.len());
                skills
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                log::error!("SkillStore: side-channel recovery failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn register(&self, skill: SkillDefinition) -> Result<(), SkillError> {
        let event = ManagerEvent::SkillRegistered {
            skill_id: skill.id.clone(),
            name: skill.name.clone(),
        };
        let snapshot;
        {
            let mut skills = self.skills.write().await;
            skills.insert(skill.id.clone(), skill);
            snapshot = Self::sorted(&skills);
        }
        self.bus.emit(&event);
        self.persist(snapshot);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), SkillError> {
        let snapshot;
        {
            let mut skills = self.skills.write().await;
            if skills.remove(id).is_none() {
                return Err(SkillError::NotFound(id.to_string()));
            }
            snapshot = Self::sorted(&skills);
        }
        self.bus.emit(&ManagerEvent::SkillRemoved {
            skill_id: id.to_string(),
        });
        self.persist(snapshot);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<SkillDefinition> {
        self.skills.read().await.get(id).cloned()
    }

    /// List all skills, optionally restricted to one category.
    pub async fn list(&self, category: Option<&str>) -> Vec<SkillDefinition> {
        let skills = self.skills.read().await;
        let mut all: Vec<SkillDefinition> = skills
            .values()
            .filter(|s| match category {
                Some(c) => s.categories.iter().any(|cat| cat == c),
                None => true,
            })
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Keyword search over id, name, description, and categories.
    pub async fn search(&self, keywords: &str) -> Vec<SkillDefinition> {
        let terms: Vec<String> = keywords
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return self.list(None).await;
        }
        let skills = self.skills.read().await;
        let mut found: Vec<SkillDefinition> = skills
            .values()
            .filter(|s| {
                let haystack = format!(
                    "{} {} {} {}",
                    s.id,
                    s.name,
                    s.description,
                    s.categories.join(" ")
                )
                .to_lowercase();
                terms.iter().any(|t| haystack.contains(t))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub async fn count(&self) -> usize {
        self.skills.read().await.len()
    }

    /// Substitute literal `{name}` placeholders with parameter values.
    ///
    /// Substitution is textual and unescaped; placeholders without a
    /// matching parameter survive in the output.
    pub fn resolve_prompt(skill: &SkillDefinition, params: &HashMap<String, String>) -> String {
        let mut prompt = skill.prompt_template.clone();
        for (key, value) in params {
            prompt = prompt.replace(&format!("{{{}}}", key), value);
        }
        prompt
    }

    /// Replace the in-memory catalog after an external file edit.
    pub async fn reload_from_disk(&self) {
        let loaded: Vec<SkillDefinition> = match self.catalog.load() {
            Ok((skills, _)) => skills,
            Err(e) => {
                log::error!("SkillStore: hot reload failed to read catalog: {}", e);
                return;
            }
        };
        let mut skills = self.skills.write().await;
        if loaded.is_empty() && !skills.is_empty() {
            log::warn!(
                "SkillStore: external wipe of skills.json ignored ({} live skill(s))",
                skills.len()
            );
            return;
        }
        skills.clear();
        for skill in loaded {
            skills.insert(skill.id.clone(), skill);
        }
    }

    pub fn arm_watcher(&self) -> Result<(), notify::Error> {
        let store = self.self_weak.clone();
        let watcher = ConfigWatcher::watch(self.catalog.path(), move || {
            if let Some(store) = store.upgrade() {
                tokio::spawn(async move {
                    store.reload_from_disk().await;
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

    fn sorted(skills: &HashMap<String, SkillDefinition>) -> Vec<SkillDefinition> {
        let mut all: Vec<SkillDefinition> = skills.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Dual-write: disk plus side channel.
    fn persist(&self, skills: Vec<SkillDefinition>) {
        if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
            watcher.mark_self_write();
        }
        if let Err(e) = self.catalog.save(&skills) {
            log::error!("SkillStore: failed to persist catalog: {}", e);
        }
        if let Some(side) = &self.side {
            let side = Arc::clone(side);
            let value = serde_json::to_value(&skills).unwrap_or_default();
            tokio::spawn(async move {
                if let Err(e) = side.store(KEY_SKILLS, &value).await {
                    log::warn!("SkillStore: side-channel push failed: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prompt_substitutes_literally() {
        let mut skill = seed(
            "s",
            "S",
            Strategy::Single,
            "Review: {code} in {language}",
            "",
            |_| {},
        );
        skill.prompt_template = "Review: {code} in {language}".to_string();
        let mut params = HashMap::new();
        params.insert("code".to_string(), "x = 1".to_string());
        let resolved = SkillStore::resolve_prompt(&skill, &params);
        // Unresolved placeholders survive.
        assert_eq!(resolved, "Review: x = 1 in {language}");
    }

    #[test]
    fn default_skill_table_is_complete() {
        let ids: Vec<&str> = DEFAULT_SKILLS.iter().map(|s| s.id.as_str()).collect();
        for expected in [
            "ask-multiple",
            "consensus-check",
            "code-review",
            "fast-answer",
            "cost-optimized",
            "security-audit",
            "explain-code",
            "commit-review",
            "refactor-suggest",
        ] {
            assert!(ids.contains(&expected), "missing default skill {}", expected);
        }
    }
}
