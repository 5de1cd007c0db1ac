//! Manager event system.
//!
//! Every observable state change in the manager flows through a single
//! [`EventBus`] as a [`ManagerEvent`]. Subscribers register plain closures
//! against an event name (or against all events) and are invoked synchronously
//! in the emitting thread, in registration order. The automation engine, the
//! dashboard SSE pump, and the metrics bookkeeping are all ordinary
//! subscribers.
//!
//! # Architecture
//!
//! ```text
//! Registry / Router / Mailbox / CrossRepo / Workspace
//!         │ emit(ManagerEvent)
//!         ▼
//!      EventBus ──► handler("task:completed")
//!                ──► handler("agent:*" via on_any + self-filtering)
//!                ──► on_any handlers (automation intake, SSE pump)
//! ```
//!
//! The bus owns no state beyond its handler table and imports nothing from
//! the rest of the crate; subscribers that need catalogs look them up by id
//! at handler time.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::agentmesh::bus::{EventBus, ManagerEvent};
//!
//! let bus = EventBus::new();
//! bus.on("skill:registered", |event| {
//!     println!("{} -> {}", event.name(), event.payload());
//! });
//! bus.emit(&ManagerEvent::SkillRegistered {
//!     skill_id: "code-review".into(),
//!     name: "Code Review".into(),
//! });
//! ```

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// The closed set of events the manager emits.
///
/// Each variant maps to a stable wire name (see [`ManagerEvent::name`]) and a
/// JSON payload with camelCase fields (see [`ManagerEvent::payload`]). The
/// payload shape is a contract: automation rules match against it with
/// dot-paths and the dashboard streams it verbatim over SSE.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A new agent entered the registry (or an existing id was overwritten).
    AgentRegistered {
        agent_id: String,
        name: String,
        provider: String,
    },
    /// An agent left the registry.
    AgentUnregistered { agent_id: String },
    /// An agent's lifecycle state changed. Carries both sides of the
    /// transition so subscribers never need to track previous state.
    AgentStateChanged {
        agent_id: String,
        previous: String,
        next: String,
        error: Option<String>,
    },
    /// A routed task began executing against its candidate set.
    TaskStarted {
        task_id: String,
        skill_id: String,
        strategy: String,
        agent_ids: Vec<String>,
    },
    /// A routed task finished (successfully or not).
    TaskCompleted {
        task_id: String,
        skill_id: String,
        strategy: String,
        success: bool,
        total_tokens: u64,
        total_cost: f64,
        duration_ms: u64,
    },
    /// A skill entered the catalog.
    SkillRegistered { skill_id: String, name: String },
    /// A skill left the catalog.
    SkillRemoved { skill_id: String },
    /// A workspace root is now being monitored.
    WorkspaceMonitoring { path: String },
    /// Monitoring for a workspace root stopped.
    WorkspaceStopped { path: String },
    /// A file changed under a monitored workspace root.
    WorkspaceFileChanged {
        path: String,
        file: String,
        kind: String,
    },
    /// A session log under a monitored workspace was created or updated.
    WorkspaceSessionUpdated { path: String, session_id: String },
    /// Git metadata under a monitored workspace changed.
    WorkspaceGitEvent {
        path: String,
        kind: String,
        detail: String,
    },
    /// A remote-tracking update was observed for a monitored workspace.
    WorkspaceRemoteUpdate { path: String, detail: String },
    /// A cross-repo dispatch was launched.
    CrossRepoDispatched {
        dispatch_id: String,
        repo_path: String,
        provider: String,
    },
    /// A cross-repo dispatch terminated.
    CrossRepoCompleted {
        dispatch_id: String,
        success: bool,
        duration_ms: u64,
    },
    /// A message was accepted into the mailbox (local send or peer inbound).
    MessageReceived {
        message_id: String,
        channel: String,
        sender: String,
    },
    /// The dashboard HTTP server finished binding.
    ServerStarted { port: u16, pid: u32 },
}

impl ManagerEvent {
    /// Stable wire name for this event, e.g. `"task:completed"`.
    pub fn name(&self) -> &'static str {
        match self {
            ManagerEvent::AgentRegistered { .. } => "agent:registered",
            ManagerEvent::AgentUnregistered { .. } => "agent:unregistered",
            ManagerEvent::AgentStateChanged { .. } => "agent:state-changed",
            ManagerEvent::TaskStarted { .. } => "task:started",
            ManagerEvent::TaskCompleted { .. } => "task:completed",
            ManagerEvent::SkillRegistered { .. } => "skill:registered",
            ManagerEvent::SkillRemoved { .. } => "skill:removed",
            ManagerEvent::WorkspaceMonitoring { .. } => "workspace:monitoring",
            ManagerEvent::WorkspaceStopped { .. } => "workspace:stopped",
            ManagerEvent::WorkspaceFileChanged { .. } => "workspace:file-changed",
            ManagerEvent::WorkspaceSessionUpdated { .. } => "workspace:session-updated",
            ManagerEvent::WorkspaceGitEvent { .. } => "workspace:git-event",
            ManagerEvent::WorkspaceRemoteUpdate { .. } => "workspace:remote-update",
            ManagerEvent::CrossRepoDispatched { .. } => "crossrepo:dispatched",
            ManagerEvent::CrossRepoCompleted { .. } => "crossrepo:completed",
            ManagerEvent::MessageReceived { .. } => "message:received",
            ManagerEvent::ServerStarted { .. } => "server:started",
        }
    }

    /// JSON payload for this event with camelCase fields plus a `timestamp`.
    ///
    /// This is the object automation dot-paths (`fromEvent`, `filters`,
    /// `{event.field}` templates) resolve against.
    pub fn payload(&self) -> Value {
        let mut value = match self {
            ManagerEvent::AgentRegistered {
                agent_id,
                name,
                provider,
            } => json!({ "agentId": agent_id, "name": name, "provider": provider }),
            ManagerEvent::AgentUnregistered { agent_id } => json!({ "agentId": agent_id }),
            ManagerEvent::AgentStateChanged {
                agent_id,
                previous,
                next,
                error,
            } => json!({
                "agentId": agent_id,
                "previousState": previous,
                "newState": next,
                "error": error,
            }),
            ManagerEvent::TaskStarted {
                task_id,
                skill_id,
                strategy,
                agent_ids,
            } => json!({
                "taskId": task_id,
                "skillId": skill_id,
                "strategy": strategy,
                "agentIds": agent_ids,
            }),
            ManagerEvent::TaskCompleted {
                task_id,
                skill_id,
                strategy,
                success,
                total_tokens,
                total_cost,
                duration_ms,
            } => json!({
                "taskId": task_id,
                "skillId": skill_id,
                "strategy": strategy,
                "success": success,
                "totalTokens": total_tokens,
                "totalCost": total_cost,
                "durationMs": duration_ms,
            }),
            ManagerEvent::SkillRegistered { skill_id, name } => {
                json!({ "skillId": skill_id, "name": name })
            }
            ManagerEvent::SkillRemoved { skill_id } => json!({ "skillId": skill_id }),
            ManagerEvent::WorkspaceMonitoring { path } => json!({ "path": path }),
            ManagerEvent::WorkspaceStopped { path } => json!({ "path": path }),
            ManagerEvent::WorkspaceFileChanged { path, file, kind } => {
                json!({ "path": path, "file": file, "kind": kind })
            }
            ManagerEvent::WorkspaceSessionUpdated { path, session_id } => {
                json!({ "path": path, "sessionId": session_id })
            }
            ManagerEvent::WorkspaceGitEvent { path, kind, detail } => {
                json!({ "path": path, "kind": kind, "detail": detail })
            }
            ManagerEvent::WorkspaceRemoteUpdate { path, detail } => {
                json!({ "path": path, "detail": detail })
            }
            ManagerEvent::CrossRepoDispatched {
                dispatch_id,
                repo_path,
                provider,
            } => json!({
                "dispatchId": dispatch_id,
                "repoPath": repo_path,
                "provider": provider,
            }),
            ManagerEvent::CrossRepoCompleted {
                dispatch_id,
                success,
                duration_ms,
            } => json!({
                "dispatchId": dispatch_id,
                "success": success,
                "durationMs": duration_ms,
            }),
            ManagerEvent::MessageReceived {
                message_id,
                channel,
                sender,
            } => json!({
                "messageId": message_id,
                "channel": channel,
                "sender": sender,
            }),
            ManagerEvent::ServerStarted { port, pid } => json!({ "port": port, "pid": pid }),
        };
        if let Some(map) = value.as_object_mut() {
            map.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        }
        value
    }
}

type Handler = Arc<dyn Fn(&ManagerEvent) + Send + Sync>;

/// Synchronous pub/sub dispatcher for [`ManagerEvent`]s.
///
/// Handlers run to completion before [`EventBus::emit`] returns, in the order
/// they were registered (named handlers first, then `on_any` handlers). A
/// panicking handler is isolated: the panic is caught and logged, and the
/// remaining handlers still run.
///
/// Handlers must not re-emit on the same event name without their own
/// re-entrancy protection.
pub struct EventBus {
    named: Mutex<HashMap<String, Vec<Handler>>>,
    any: Mutex<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            named: Mutex::new(HashMap::new()),
            any: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe a handler to one event name.
    pub fn on<F>(&self, name: &str, handler: F)
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        let mut named = self.named.lock().unwrap();
        named
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Subscribe a handler to every event.
    ///
    /// This is what the automation intake and the SSE pump use; they filter
    /// by name themselves.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        self.any.lock().unwrap().push(Arc::new(handler));
    }

    /// Dispatch an event to all matching handlers.
    pub fn emit(&self, event: &ManagerEvent) {
        // Snapshot the handler lists so a handler can subscribe (or emit a
        // different event name) without deadlocking on the handler table.
        let named: Vec<Handler> = {
            let table = self.named.lock().unwrap();
            table.get(event.name()).cloned().unwrap_or_default()
        };
        let any: Vec<Handler> = self.any.lock().unwrap().clone();

        for handler in named.iter().chain(any.iter()) {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (**handler)(event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                log::error!(
                    "EventBus: handler for '{}' panicked: {}",
                    event.name(),
                    detail
                );
            }
        }
    }

    /// Number of handlers currently registered (named + any).
    pub fn handler_count(&self) -> usize {
        let named = self.named.lock().unwrap();
        let any = self.any.lock().unwrap();
        named.values().map(|v| v.len()).sum::<usize>() + any.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn skill_event() -> ManagerEvent {
        ManagerEvent::SkillRegistered {
            skill_id: "s1".into(),
            name: "Skill One".into(),
        }
    }

    #[test]
    fn dispatches_to_named_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on("skill:registered", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&skill_event());
        bus.emit(&ManagerEvent::SkillRemoved {
            skill_id: "s1".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_any_sees_every_event() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on_any(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&skill_event());
        bus.emit(&ManagerEvent::SkillRemoved {
            skill_id: "s1".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on("skill:registered", |_| panic!("boom"));
        let h = hits.clone();
        bus.on("skill:registered", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&skill_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let o = order.clone();
            bus.on("skill:registered", move |_| {
                o.lock().unwrap().push(i);
            });
        }
        bus.emit(&skill_event());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn payload_carries_camel_case_fields() {
        let payload = skill_event().payload();
        assert_eq!(payload["skillId"], "s1");
        assert!(payload["timestamp"].is_string());

        let payload = ManagerEvent::AgentStateChanged {
            agent_id: "a".into(),
            previous: "idle".into(),
            next: "running".into(),
            error: None,
        }
        .payload();
        assert_eq!(payload["previousState"], "idle");
        assert_eq!(payload["newState"], "running");
    }
}
