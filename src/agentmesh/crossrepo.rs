//! Cross-repo dispatcher: run subprocess agents against an arbitrary
//! working directory under a global concurrency cap.
//!
//! Admission is reject-not-queue: when the cap is reached a dispatch fails
//! with `queue-full` immediately. A dispatch prefers routing through a
//! registered agent of the matching provider (so its tokens and counters
//! land in the unified registry metrics) and falls back to a direct
//! subprocess spawn when no agent is available or the agent-routed attempt
//! fails.
//!
//! Direct spawns keep a live entry with incrementally captured
//! stdout/stderr and the child pid, which makes cooperative cancellation
//! possible: SIGTERM first, SIGKILL after a grace period. Completed
//! dispatches land in a bounded ring and are appended to
//! `state/crossrepo-history.jsonl` for cross-process visibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::agentmesh::bus::{EventBus, ManagerEvent};
use crate::agentmesh::persist::JsonlLog;
use crate::agentmesh::provider::{ProviderSet, DEFAULT_TIMEOUT_MS, PARTIAL_CONTENT_MIN_CHARS};
use crate::agentmesh::providers::subprocess::{cli_binary, one_shot_args, resolve_executable};
use crate::agentmesh::registry::{AgentInstance, AgentRegistry, ProviderKind};
use crate::agentmesh::router::invoke_agent;

/// Completed dispatches kept in the ring.
const RESULT_RING: usize = 100;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Input to [`CrossRepoDispatcher::dispatch`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub repo_path: String,
    pub prompt: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Pin the agent-routed path to a specific registered agent.
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Persisted record of a finished dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEntry {
    pub dispatch_id: String,
    pub repo_path: String,
    pub provider: ProviderKind,
    /// Set when the dispatch went through a registered agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    pub status: DispatchStatus,
    pub success: bool,
    pub content: String,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Live view of an in-flight dispatch.
struct LiveDispatch {
    repo_path: String,
    provider: ProviderKind,
    started_at: DateTime<Utc>,
    pid: Option<u32>,
    stdout: Arc<StdMutex<Vec<u8>>>,
    stderr: Arc<StdMutex<Vec<u8>>>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug)]
pub enum CrossRepoError {
    /// The global concurrency cap is reached.
    QueueFull { cap: usize },
    NotFound(String),
}

impl fmt::Display for CrossRepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossRepoError::QueueFull { cap } => {
                write!(f, "queue-full: {} dispatch(es) already running", cap)
            }
            CrossRepoError::NotFound(id) => write!(f, "unknown dispatch '{}'", id),
        }
    }
}

impl Error for CrossRepoError {}

pub struct CrossRepoDispatcher {
    self_weak: Weak<CrossRepoDispatcher>,
    live: RwLock<HashMap<String, LiveDispatch>>,
    results: RwLock<VecDeque<DispatchEntry>>,
    cap: usize,
    registry: Arc<AgentRegistry>,
    providers: Arc<ProviderSet>,
    bus: Arc<EventBus>,
    history: JsonlLog,
}

impl CrossRepoDispatcher {
    pub fn new(
        history_path: impl Into<PathBuf>,
        cap: usize,
        registry: Arc<AgentRegistry>,
        providers: Arc<ProviderSet>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let history = JsonlLog::new(history_path);
        let mut results = VecDeque::new();
        if let Ok(entries) = history.load::<DispatchEntry, _>(|e| e.dispatch_id.clone()) {
            for entry in entries.into_iter().rev().take(RESULT_RING) {
                results.push_back(entry);
            }
        }
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            live: RwLock::new(HashMap::new()),
            results: RwLock::new(results),
            cap: cap.max(1),
            registry,
            providers,
            bus,
            history,
        })
    }

    /// Launch a dispatch. Rejects with `queue-full` at the cap.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<String, CrossRepoError> {
        let dispatch_id = uuid::Uuid::new_v4().to_string();
        {
            let mut live = self.live.write().await;
            if live.len() >= self.cap {
                return Err(CrossRepoError::QueueFull { cap: self.cap });
            }
            live.insert(
                dispatch_id.clone(),
                LiveDispatch {
                    repo_path: request.repo_path.clone(),
                    provider: request.provider,
                    started_at: Utc::now(),
                    pid: None,
                    stdout: Arc::new(StdMutex::new(Vec::new())),
                    stderr: Arc::new(StdMutex::new(Vec::new())),
                    cancelled: Arc::new(AtomicBool::new(false)),
                },
            );
        }
        self.bus.emit(&ManagerEvent::CrossRepoDispatched {
            dispatch_id: dispatch_id.clone(),
            repo_path: request.repo_path.clone(),
            provider: request.provider.as_str().to_string(),
        });

        if let Some(dispatcher) = self.self_weak.upgrade() {
            let id = dispatch_id.clone();
            tokio::spawn(async move {
                dispatcher.run(id, request).await;
            });
        }
        Ok(dispatch_id)
    }

    /// Dispatch a batch; each entry is admitted (or rejected) independently.
    pub async fn batch_dispatch(
        &self,
        requests: Vec<DispatchRequest>,
    ) -> Vec<Result<String, CrossRepoError>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.dispatch(request).await);
        }
        outcomes
    }

    async fn run(self: Arc<Self>, dispatch_id: String, request: DispatchRequest) {
        let started_at = {
            let live = self.live.read().await;
            live.get(&dispatch_id)
                .map(|l| l.started_at)
                .unwrap_or_else(Utc::now)
        };
        let started = Instant::now();
        let timeout_ms = request.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);

        // Agent-routed attempt first.
        let mut agent_id = None;
        let mut outcome: Option<(bool, String, Option<String>)> = None;
        if let Some(instance) = self.pick_agent(&request).await {
            agent_id = Some(instance.config.id.clone());
            let mut config = instance.config.clone();
            config.cwd = Some(request.repo_path.clone());
            let routed = invoke_agent(
                Arc::clone(&self.registry),
                Arc::clone(&self.providers),
                AgentInstance {
                    config,
                    runtime: instance.runtime,
                },
                request.prompt.clone(),
                None,
                timeout_ms,
            )
            .await;
            if routed.success {
                outcome = Some((true, routed.content, routed.error));
            } else {
                log::warn!(
                    "CrossRepoDispatcher: agent-routed attempt via '{}' failed ({:?}), \
                     falling back to direct spawn",
                    instance.config.id,
                    routed.error
                );
            }
        }

        let (success, content, error) = match outcome {
            Some(outcome) => outcome,
            None => self.run_direct(&dispatch_id, &request, timeout_ms).await,
        };

        let cancelled = {
            let live = self.live.read().await;
            live.get(&dispatch_id)
                .map(|l| l.cancelled.load(Ordering::SeqCst))
                .unwrap_or(false)
        };
        let status = if cancelled {
            DispatchStatus::Cancelled
        } else if success {
            DispatchStatus::Completed
        } else {
            DispatchStatus::Failed
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let entry = DispatchEntry {
            dispatch_id: dispatch_id.clone(),
            repo_path: request.repo_path.clone(),
            provider: request.provider,
            agent_id,
            status,
            success: success && !cancelled,
            content,
            error,
            started_at,
            completed_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
        };

        self.live.write().await.remove(&dispatch_id);
        {
            let mut results = self.results.write().await;
            results.push_front(entry.clone());
            results.truncate(RESULT_RING);
        }
        if let Err(e) = self.history.append(&entry) {
            log::error!("CrossRepoDispatcher: failed to persist entry: {}", e);
        }
        self.bus.emit(&ManagerEvent::CrossRepoCompleted {
            dispatch_id,
            success: entry.success,
            duration_ms,
        });
    }

    async fn pick_agent(&self, request: &DispatchRequest) -> Option<AgentInstance> {
        if let Some(agent_id) = &request.agent_id {
            let instance = self.registry.get(agent_id).await?;
            let available = instance.runtime.state.is_schedulable()
                && instance.runtime.active_tasks < instance.config.max_concurrency;
            return available.then_some(instance);
        }
        let mut candidates = self.registry.find_by_provider(request.provider).await;
        candidates.retain(|a| {
            a.runtime.state.is_schedulable()
                && a.runtime.active_tasks < a.config.max_concurrency
        });
        candidates.sort_by(|a, b| {
            a.runtime
                .active_tasks
                .cmp(&b.runtime.active_tasks)
                .then(a.config.id.cmp(&b.config.id))
        });
        candidates.into_iter().next()
    }

    /// Direct subprocess path with live capture and pid tracking.
    async fn run_direct(
        &self,
        dispatch_id: &str,
        request: &DispatchRequest,
        timeout_ms: u64,
    ) -> (bool, String, Option<String>) {
        let binary = match resolve_executable(None, cli_binary(request.provider)) {
            Ok(binary) => binary,
            Err(e) => return (false, String::new(), Some(e.to_string())),
        };
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| default_model(request.provider).to_string());
        let mut cmd = Command::new(binary);
        cmd.args(one_shot_args(request.provider, &model))
            .arg(&request.prompt)
            .current_dir(&request.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return (false, String::new(), Some(format!("spawn failed: {}", e))),
        };

        let (stdout_buf, stderr_buf, cancelled) = {
            let mut live = self.live.write().await;
            match live.get_mut(dispatch_id) {
                Some(entry) => {
                    entry.pid = child.id();
                    (
                        entry.stdout.clone(),
                        entry.stderr.clone(),
                        entry.cancelled.clone(),
                    )
                }
                None => (
                    Arc::new(StdMutex::new(Vec::new())),
                    Arc::new(StdMutex::new(Vec::new())),
                    Arc::new(AtomicBool::new(false)),
                ),
            }
        };
        if let Some(mut stdout) = child.stdout.take() {
            let sink = stdout_buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stdout.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.lock().unwrap().extend_from_slice(&chunk[..n]),
                    }
                }
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            let sink = stderr_buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.lock().unwrap().extend_from_slice(&chunk[..n]),
                    }
                }
            });
        }

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
        };

        let content = String::from_utf8_lossy(&stdout_buf.lock().unwrap())
            .trim()
            .to_string();
        match status {
            Some(Ok(status)) => {
                if cancelled.load(Ordering::SeqCst) {
                    (false, content, Some("cancelled".to_string()))
                } else if status.success() {
                    (true, content, None)
                } else {
                    let stderr = String::from_utf8_lossy(&stderr_buf.lock().unwrap())
                        .trim()
                        .to_string();
                    (
                        false,
                        content,
                        Some(format!(
                            "exit {}: {}",
                            status.code().unwrap_or(-1),
                            stderr
                        )),
                    )
                }
            }
            Some(Err(e)) => (false, content, Some(e.to_string())),
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                if content.chars().count() > PARTIAL_CONTENT_MIN_CHARS {
                    (
                        true,
                        content,
                        Some(format!("partial output: timed out after {}ms", timeout_ms)),
                    )
                } else {
                    (false, content, Some(format!("timed out after {}ms", timeout_ms)))
                }
            }
        }
    }

    /// Cooperative cancellation: SIGTERM now, SIGKILL after the grace
    /// period if the dispatch is still live.
    pub async fn cancel(&self, dispatch_id: &str) -> Result<(), CrossRepoError> {
        let pid = {
            let live = self.live.read().await;
            let entry = live
                .get(dispatch_id)
                .ok_or_else(|| CrossRepoError::NotFound(dispatch_id.to_string()))?;
            entry.cancelled.store(true, Ordering::SeqCst);
            entry.pid
        };
        let Some(pid) = pid else {
            // Agent-routed dispatch: no child of our own to signal. The
            // cancelled flag downgrades the eventual result.
            return Ok(());
        };
        send_signal(pid, false);
        let dispatcher = self.self_weak.clone();
        let id = dispatch_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let Some(dispatcher) = dispatcher.upgrade() else { return };
            let still_live = dispatcher.live.read().await.contains_key(&id);
            if still_live {
                log::warn!(
                    "CrossRepoDispatcher: dispatch '{}' survived SIGTERM, escalating to SIGKILL",
                    id
                );
                send_signal(pid, true);
            }
        });
        Ok(())
    }

    /// Live dispatches with their captured output so far.
    pub async fn status(&self) -> serde_json::Value {
        let live = self.live.read().await;
        let active: Vec<serde_json::Value> = live
            .iter()
            .map(|(id, entry)| {
                serde_json::json!({
                    "dispatchId": id,
                    "repoPath": entry.repo_path,
                    "provider": entry.provider,
                    "startedAt": entry.started_at,
                    "pid": entry.pid,
                    "stdoutBytes": entry.stdout.lock().unwrap().len(),
                    "stderrBytes": entry.stderr.lock().unwrap().len(),
                })
            })
            .collect();
        serde_json::json!({
            "active": active,
            "activeCount": live.len(),
            "capacity": self.cap,
        })
    }

    pub async fn history(&self, limit: Option<usize>) -> Vec<DispatchEntry> {
        let results = self.results.read().await;
        results
            .iter()
            .take(limit.unwrap_or(RESULT_RING))
            .cloned()
            .collect()
    }

    pub async fn get(&self, dispatch_id: &str) -> Option<DispatchEntry> {
        let results = self.results.read().await;
        results.iter().find(|e| e.dispatch_id == dispatch_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.live.read().await.len()
    }
}

fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::ClaudeCode => "claude-sonnet-4-0",
        ProviderKind::GeminiCli => "gemini-2.5-flash",
        ProviderKind::Codex => "gpt-4.1",
        _ => "",
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, kill: bool) {
    use nix::sys::signal::{kill as send, Signal};
    use nix::unistd::Pid;
    let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = send(Pid::from_raw(pid as i32), signal) {
        log::debug!("CrossRepoDispatcher: signal {} to {} failed: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _kill: bool) {}
