//! Workspace monitoring, the thin edge of it.
//!
//! The manager only *consumes* workspace activity: a watched root turns
//! filesystem changes into `workspace:file-changed` / `workspace:git-event`
//! bus events for the automation engine, and `mine_sessions` turns on-disk
//! agent session logs into `workspace:session-updated` events. Analysis of
//! what changed is someone else's job (an external collaborator); nothing
//! here inspects file contents.

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use crate::agentmesh::bus::{EventBus, ManagerEvent};
use crate::agentmesh::persist::CatalogFile;

/// History entries kept in memory (and persisted).
const HISTORY_KEPT: usize = 500;

/// Persist the history every N file events to keep churny repos cheap.
const HISTORY_FLUSH_EVERY: u64 = 50;

/// Summary of one monitored workspace root.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub file_events: u64,
}

/// One entry of the persisted workspace history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceHistoryEntry {
    pub path: String,
    pub event: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

struct WatchedWorkspace {
    info: WorkspaceInfo,
    // Dropping tears down the OS watch.
    _watcher: RecommendedWatcher,
}

#[derive(Debug)]
pub enum WorkspaceError {
    NotMonitored(String),
    AlreadyMonitored(String),
    Watch(String),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::NotMonitored(path) => write!(f, "workspace not monitored: {}", path),
            WorkspaceError::AlreadyMonitored(path) => {
                write!(f, "workspace already monitored: {}", path)
            }
            WorkspaceError::Watch(detail) => write!(f, "failed to watch workspace: {}", detail),
        }
    }
}

impl Error for WorkspaceError {}

pub struct WorkspaceMonitor {
    self_weak: Weak<WorkspaceMonitor>,
    workspaces: RwLock<HashMap<String, WatchedWorkspace>>,
    history: RwLock<Vec<WorkspaceHistoryEntry>>,
    catalog: CatalogFile,
    bus: Arc<EventBus>,
}

impl WorkspaceMonitor {
    pub fn new(history_path: impl Into<PathBuf>, bus: Arc<EventBus>) -> Arc<Self> {
        let catalog = CatalogFile::new(history_path);
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            workspaces: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            catalog,
            bus,
        })
    }

    pub async fn load(&self) {
        if let Ok((entries, _)) = self.catalog.load::<WorkspaceHistoryEntry>() {
            *self.history.write().await = entries;
        }
    }

    /// Start monitoring a workspace root.
    pub async fn monitor(&self, path: &str) -> Result<WorkspaceInfo, WorkspaceError> {
        let root = normalize(path);
        {
            let workspaces = self.workspaces.read().await;
            if workspaces.contains_key(&root) {
                return Err(WorkspaceError::AlreadyMonitored(root));
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(PathBuf, String)>();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let kind = kind_label(&event.kind);
                    for path in event.paths {
                        let _ = tx.send((path, kind.to_string()));
                    }
                }
            },
        )
        .map_err(|e| WorkspaceError::Watch(e.to_string()))?;
        watcher
            .watch(Path::new(&root), RecursiveMode::Recursive)
            .map_err(|e| WorkspaceError::Watch(e.to_string()))?;

        let info = WorkspaceInfo {
            path: root.clone(),
            started_at: Utc::now(),
            last_event_at: None,
            file_events: 0,
        };
        {
            let mut workspaces = self.workspaces.write().await;
            workspaces.insert(
                root.clone(),
                WatchedWorkspace {
                    info: info.clone(),
                    _watcher: watcher,
                },
            );
        }

        // Pump filesystem events onto the bus until the workspace is
        // unwatched (sender dropped with the watcher).
        let monitor = self.self_weak.clone();
        let workspace_root = root.clone();
        tokio::spawn(async move {
            while let Some((changed, kind)) = rx.recv().await {
                let Some(monitor) = monitor.upgrade() else { break };
                monitor.on_fs_event(&workspace_root, &changed, &kind).await;
            }
        });

        self.bus
            .emit(&ManagerEvent::WorkspaceMonitoring { path: root.clone() });
        self.push_history(&root, "monitoring", "watch started", true)
            .await;
        Ok(info)
    }

    /// Stop monitoring a workspace root.
    pub async fn stop(&self, path: &str) -> Result<(), WorkspaceError> {
        let root = normalize(path);
        let removed = self.workspaces.write().await.remove(&root);
        if removed.is_none() {
            return Err(WorkspaceError::NotMonitored(root));
        }
        self.bus
            .emit(&ManagerEvent::WorkspaceStopped { path: root.clone() });
        self.push_history(&root, "stopped", "watch stopped", true).await;
        Ok(())
    }

    pub async fn status(&self) -> Vec<WorkspaceInfo> {
        let workspaces = self.workspaces.read().await;
        let mut all: Vec<WorkspaceInfo> =
            workspaces.values().map(|w| w.info.clone()).collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    pub async fn get(&self, path: &str) -> Option<WorkspaceInfo> {
        let root = normalize(path);
        self.workspaces.read().await.get(&root).map(|w| w.info.clone())
    }

    /// Workspace history, optionally restricted to one root, newest first.
    pub async fn history(&self, path: Option<&str>) -> Vec<WorkspaceHistoryEntry> {
        let root = path.map(normalize);
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .filter(|e| root.as_ref().map(|r| &e.path == r).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Scan the workspace's session-log directory and emit a
    /// `workspace:session-updated` event per log found. Returns the session
    /// ids discovered.
    pub async fn mine_sessions(&self, path: &str) -> Vec<String> {
        let root = normalize(path);
        let session_dir = session_dir_for(&root);
        let mut sessions = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&session_dir) {
            for entry in entries.flatten() {
                let file = entry.path();
                if file.extension().map(|e| e == "jsonl").unwrap_or(false) {
                    if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                        sessions.push(stem.to_string());
                        self.bus.emit(&ManagerEvent::WorkspaceSessionUpdated {
                            path: root.clone(),
                            session_id: stem.to_string(),
                        });
                    }
                }
            }
        }
        if !sessions.is_empty() {
            self.push_history(
                &root,
                "sessions-mined",
                &format!("{} session log(s)", sessions.len()),
                true,
            )
            .await;
        }
        sessions
    }

    async fn on_fs_event(&self, root: &str, changed: &Path, kind: &str) {
        let file = changed
            .strip_prefix(root)
            .unwrap_or(changed)
            .to_string_lossy()
            .to_string();

        let flush = {
            let mut workspaces = self.workspaces.write().await;
            match workspaces.get_mut(root) {
                Some(workspace) => {
                    workspace.info.file_events += 1;
                    workspace.info.last_event_at = Some(Utc::now());
                    workspace.info.file_events % HISTORY_FLUSH_EVERY == 0
                }
                None => return,
            }
        };

        if file.starts_with(".git/") || file.contains("/.git/") {
            self.bus.emit(&ManagerEvent::WorkspaceGitEvent {
                path: root.to_string(),
                kind: kind.to_string(),
                detail: file.clone(),
            });
        } else {
            self.bus.emit(&ManagerEvent::WorkspaceFileChanged {
                path: root.to_string(),
                file: file.clone(),
                kind: kind.to_string(),
            });
        }
        self.push_history(root, "file-changed", &file, flush).await;
    }

    async fn push_history(&self, path: &str, event: &str, detail: &str, persist: bool) {
        let snapshot = {
            let mut history = self.history.write().await;
            history.push(WorkspaceHistoryEntry {
                path: path.to_string(),
                event: event.to_string(),
                detail: detail.to_string(),
                at: Utc::now(),
            });
            let overflow = history.len().saturating_sub(HISTORY_KEPT);
            if overflow > 0 {
                history.drain(..overflow);
            }
            persist.then(|| history.clone())
        };
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.catalog.save(&snapshot) {
                log::error!("WorkspaceMonitor: failed to persist history: {}", e);
            }
        }
    }
}

fn normalize(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.trim_end_matches('/').to_string())
}

fn kind_label(kind: &notify::EventKind) -> &'static str {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => "create",
        EventKind::Modify(_) => "modify",
        EventKind::Remove(_) => "remove",
        _ => "other",
    }
}

/// Session logs live under the per-user agent state directory, one
/// directory per workspace (path separators flattened to dashes).
fn session_dir_for(root: &str) -> PathBuf {
    let base = std::env::var("AGENTMESH_SESSIONS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_default()
                .join(".agentmesh")
                .join("sessions")
        });
    base.join(root.replace(['/', '\\'], "-"))
}
