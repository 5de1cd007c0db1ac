//! The manager: owns every subsystem and wires them together.
//!
//! Construction order follows the dependency graph (bus first, catalogs
//! next, router on top of them, automation and dashboard last):
//!
//! ```text
//! EventBus
//!   ├─ AgentRegistry ──┐
//!   ├─ SkillStore ─────┼─► Router ──► AutomationEngine
//!   ├─ Mailbox         │      └────► CrossRepoDispatcher
//!   └─ WorkspaceMonitor┘
//!                      └─► Dashboard (HTTP + SSE + port file)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::{Manager, ManagerConfig};
//!
//! # async {
//! let manager = Manager::start(ManagerConfig::default()).await.unwrap();
//! let snapshot = manager.snapshot().await;
//! println!("{} agents", snapshot["agents"].as_array().map(|a| a.len()).unwrap_or(0));
//! manager.shutdown().await;
//! # };
//! ```

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::error::Error;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use crate::agentmesh::automation::{AutomationEngine, ExecutionStatus};
use crate::agentmesh::bus::EventBus;
use crate::agentmesh::config::{ensure_layout, ManagerConfig};
use crate::agentmesh::crossrepo::CrossRepoDispatcher;
use crate::agentmesh::dashboard::{self, sweep_stale_port_files, DashboardHandle};
use crate::agentmesh::mailbox::Mailbox;
use crate::agentmesh::provider::ProviderSet;
use crate::agentmesh::registry::AgentRegistry;
use crate::agentmesh::router::Router;
use crate::agentmesh::sidechannel::IndexClient;
use crate::agentmesh::skills::SkillStore;
use crate::agentmesh::tools::ToolDispatcher;
use crate::agentmesh::workspace::WorkspaceMonitor;

/// A running manager instance.
pub struct Manager {
    self_weak: Weak<Manager>,
    config: ManagerConfig,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillStore>,
    providers: Arc<ProviderSet>,
    router: Arc<Router>,
    mailbox: Arc<Mailbox>,
    automation: Arc<AutomationEngine>,
    crossrepo: Arc<CrossRepoDispatcher>,
    workspaces: Arc<WorkspaceMonitor>,
    dashboard: StdMutex<Option<DashboardHandle>>,
    started_at: DateTime<Utc>,
}

impl Manager {
    /// Boot a manager: load every catalog (walking their recovery ladders),
    /// seed defaults, arm the hot-reload watchers, start the background
    /// services, and bring up the dashboard.
    pub async fn start(config: ManagerConfig) -> Result<Arc<Manager>, Box<dyn Error + Send + Sync>> {
        ensure_layout(&config)?;
        sweep_stale_port_files(&config.state_dir());

        let bus = Arc::new(EventBus::new());
        let side = config
            .index_server
            .as_deref()
            .map(|url| Arc::new(IndexClient::new(url)));

        let registry = AgentRegistry::new(config.agents_file(), Arc::clone(&bus), side.clone());
        let agents = registry.load().await?;
        let skills = SkillStore::new(config.skills_file(), Arc::clone(&bus), side.clone());
        let skill_count = skills.load().await?;
        log::info!(
            "Manager: loaded {} agent(s) and {} skill(s)",
            agents,
            skill_count
        );

        let providers = Arc::new(ProviderSet::with_defaults());
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&skills),
            Arc::clone(&providers),
            Arc::clone(&bus),
            config.task_history_file(),
            config.router_metrics_file(),
            config.history_limit,
        ));

        let mailbox = Mailbox::new(config.messages_file(), config.state_dir(), Arc::clone(&bus));
        let messages = mailbox.load().await;
        log::info!("Manager: mailbox holds {} live message(s)", messages);
        mailbox.start_sweeper(config.mailbox_sweep_secs);

        let automation = AutomationEngine::new(
            config.rules_file(),
            Arc::clone(&router),
            Arc::clone(&registry),
            Arc::clone(&skills),
            Arc::clone(&bus),
        );
        automation.load().await?;

        let crossrepo = CrossRepoDispatcher::new(
            config.crossrepo_history_file(),
            config.cross_repo_limit,
            Arc::clone(&registry),
            Arc::clone(&providers),
            Arc::clone(&bus),
        );
        let workspaces = WorkspaceMonitor::new(config.workspace_history_file(), Arc::clone(&bus));
        workspaces.load().await;

        // Hot reload for external edits to the three JSON catalogs.
        if let Err(e) = registry.arm_watcher() {
            log::warn!("Manager: agent catalog watcher unavailable: {}", e);
        }
        if let Err(e) = skills.arm_watcher() {
            log::warn!("Manager: skill catalog watcher unavailable: {}", e);
        }
        if let Err(e) = automation.arm_watcher() {
            log::warn!("Manager: rule catalog watcher unavailable: {}", e);
        }
        automation.start();

        let manager = Arc::new_cyclic(|weak| Manager {
            self_weak: weak.clone(),
            config,
            bus,
            registry,
            skills,
            providers,
            router,
            mailbox,
            automation,
            crossrepo,
            workspaces,
            dashboard: StdMutex::new(None),
            started_at: Utc::now(),
        });

        match dashboard::start(Arc::clone(&manager)).await {
            Ok(handle) => {
                *manager.dashboard.lock().unwrap() = Some(handle);
            }
            Err(e) => {
                // The manager is still useful headless (tool surface only).
                log::error!("Manager: dashboard failed to start: {}", e);
            }
        }

        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn skills(&self) -> &Arc<SkillStore> {
        &self.skills
    }

    pub fn providers(&self) -> &Arc<ProviderSet> {
        &self.providers
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn automation(&self) -> &Arc<AutomationEngine> {
        &self.automation
    }

    pub fn crossrepo(&self) -> &Arc<CrossRepoDispatcher> {
        &self.crossrepo
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceMonitor> {
        &self.workspaces
    }

    pub fn dashboard_port(&self) -> Option<u16> {
        self.dashboard.lock().unwrap().as_ref().map(|h| h.port)
    }

    /// The transport-agnostic tool surface bound to this manager.
    pub fn tools(&self) -> ToolDispatcher {
        ToolDispatcher::new(self.self_weak.clone())
    }

    /// Full dashboard state: everything a UI needs in one document.
    pub async fn snapshot(&self) -> Value {
        let agents = self.registry.get_all().await;
        let skills = self.skills.list(None).await;
        let rules = self.automation.list_rules(None).await;
        let history = self.router.history(None).await;
        let metrics = self.router.metrics().await;
        let executions = self.automation.executions(Some(50)).await;
        let review_queue: Vec<_> = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .cloned()
            .collect();

        json!({
            "pid": std::process::id(),
            "startedAt": self.started_at,
            "port": self.dashboard_port(),
            "agents": agents,
            "skills": skills,
            "rules": rules,
            "tasks": {
                "history": history,
                "metrics": metrics,
            },
            "crossRepo": {
                "status": self.crossrepo.status().await,
                "history": self.crossrepo.history(Some(20)).await,
            },
            "messaging": {
                "stats": self.mailbox.stats().await,
                "channels": self.mailbox.list_channels().await,
            },
            "workspaces": self.workspaces.status().await,
            "automation": self.automation.get_status().await,
            "reviewQueue": review_queue,
        })
    }

    /// Clean shutdown: force-stop agents, silence automation, stop the
    /// watchers, and take down the dashboard (removing the port file).
    pub async fn shutdown(&self) {
        log::info!("Manager: shutting down");
        self.automation.set_enabled(false);
        self.registry.stop_all().await;
        self.registry.disarm_watcher();
        self.skills.disarm_watcher();
        self.automation.disarm_watcher();
        if let Some(mut handle) = self.dashboard.lock().unwrap().take() {
            handle.shutdown();
        }
    }
}
