//! Manager configuration and on-disk layout.
//!
//! [`ManagerConfig`] is constructed in code — no TOML/YAML parsing. The only
//! environment the manager consults is what the `agentmeshd` binary reads at
//! startup (`AGENTMESH_DATA_DIR`, `AGENTMESH_PORT`, `AGENTMESH_INDEX_URL`).
//!
//! # Data directory layout
//!
//! ```text
//! <data_dir>/
//!   agents/agents.json             agent catalog (+ .bak shadow)
//!   skills/skills.json             skill catalog (+ .bak shadow)
//!   automation/rules.json          automation rules (+ .bak shadow)
//!   messaging/messages.jsonl       mailbox log
//!   workspace/workspace-history.json
//!   state/task-history.jsonl       router history ring, persisted
//!   state/router-metrics.json      global router counters
//!   state/crossrepo-history.jsonl  completed cross-repo dispatches
//!   state/.state-version           layout version stamp
//!   state/dashboard-<pid>.json     per-process dashboard port file
//!   logs/
//! ```

use std::path::{Path, PathBuf};

/// Current on-disk layout version, written to `state/.state-version`.
pub const STATE_VERSION: u32 = 1;

/// Global configuration for a [`Manager`](crate::Manager) instance.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of all persisted state. Shared by peer instances on this host.
    pub data_dir: PathBuf,
    /// Preferred dashboard port; binding retries up to `port + 10`.
    pub dashboard_port: u16,
    /// Base URL of the index-server side channel, if any.
    pub index_server: Option<String>,
    /// Concurrency cap for the cross-repo dispatcher.
    pub cross_repo_limit: usize,
    /// Interval of the mailbox TTL sweeper, in seconds.
    pub mailbox_sweep_secs: u64,
    /// In-memory task-history ring size.
    pub history_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agentmesh");
        Self {
            data_dir,
            dashboard_port: 3900,
            index_server: None,
            cross_repo_limit: 5,
            mailbox_sweep_secs: 60,
            history_limit: 50,
        }
    }
}

impl ManagerConfig {
    /// Config rooted at an explicit data directory (tests, peers).
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn agents_file(&self) -> PathBuf {
        self.data_dir.join("agents").join("agents.json")
    }

    pub fn skills_file(&self) -> PathBuf {
        self.data_dir.join("skills").join("skills.json")
    }

    pub fn rules_file(&self) -> PathBuf {
        self.data_dir.join("automation").join("rules.json")
    }

    pub fn messages_file(&self) -> PathBuf {
        self.data_dir.join("messaging").join("messages.jsonl")
    }

    pub fn workspace_history_file(&self) -> PathBuf {
        self.data_dir.join("workspace").join("workspace-history.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn task_history_file(&self) -> PathBuf {
        self.state_dir().join("task-history.jsonl")
    }

    pub fn router_metrics_file(&self) -> PathBuf {
        self.state_dir().join("router-metrics.json")
    }

    pub fn crossrepo_history_file(&self) -> PathBuf {
        self.state_dir().join("crossrepo-history.jsonl")
    }

    pub fn state_version_file(&self) -> PathBuf {
        self.state_dir().join(".state-version")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Port file for a given manager process.
    pub fn port_file(&self, pid: u32) -> PathBuf {
        self.state_dir().join(format!("dashboard-{}.json", pid))
    }
}

/// Create every directory of the layout under `data_dir`.
pub fn ensure_layout(config: &ManagerConfig) -> std::io::Result<()> {
    for dir in [
        config.data_dir.join("agents"),
        config.data_dir.join("skills"),
        config.data_dir.join("automation"),
        config.data_dir.join("messaging"),
        config.data_dir.join("workspace"),
        config.state_dir(),
        config.logs_dir(),
    ] {
        std::fs::create_dir_all(dir)?;
    }
    let version_file = config.state_version_file();
    if !version_file.exists() {
        std::fs::write(&version_file, STATE_VERSION.to_string())?;
    }
    Ok(())
}

/// Read the layout version stamp, if present.
pub fn read_state_version(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join(".state-version"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
