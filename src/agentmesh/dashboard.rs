//! Observability dashboard: a localhost HTTP API plus an SSE stream, and
//! the port-file mechanism peer instances use to find each other.
//!
//! Every manager process writes `state/dashboard-<pid>.json` on startup and
//! removes it on clean shutdown; stale files left by dead processes are
//! swept at boot. Peer discovery is just "enumerate the port files, probe
//! the pids" — no registry service, no multicast.
//!
//! The SSE stream publishes every bus event as its own frame and follows
//! each with a full `snapshot` frame, so a dashboard client can stay dumb:
//! render the latest snapshot, animate on the events.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::agentmesh::bus::ManagerEvent;
use crate::agentmesh::mailbox::{MessagePatch, ReadOptions, SendOptions};
use crate::agentmesh::manager::Manager;

/// How many ports above the preferred one to try before giving up.
const BIND_RETRIES: u16 = 10;

/// Contents of a `dashboard-<pid>.json` port file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFile {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub cwd: String,
}

/// Write this process's port file.
pub fn write_port_file(state_dir: &Path, port: u16) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(state_dir)?;
    let pid = std::process::id();
    let path = state_dir.join(format!("dashboard-{}.json", pid));
    let entry = PortFile {
        pid,
        port,
        started_at: Utc::now(),
        cwd: std::env::current_dir()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    std::fs::write(&path, serde_json::to_string_pretty(&entry)?)?;
    Ok(path)
}

/// Remove this process's port file (clean shutdown).
pub fn remove_port_file(state_dir: &Path) {
    let path = state_dir.join(format!("dashboard-{}.json", std::process::id()));
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("dashboard: failed to remove port file: {}", e);
        }
    }
}

/// Drop port files whose pid no longer answers a liveness probe.
pub fn sweep_stale_port_files(state_dir: &Path) -> usize {
    let mut swept = 0;
    for entry in list_port_files(state_dir) {
        if !pid_alive(entry.pid) {
            let path = state_dir.join(format!("dashboard-{}.json", entry.pid));
            if std::fs::remove_file(&path).is_ok() {
                log::info!("dashboard: swept stale port file for pid {}", entry.pid);
                swept += 1;
            }
        }
    }
    swept
}

/// Live peer dashboards on this host, excluding `exclude_pid` when given.
pub fn discover_peers(state_dir: &Path, exclude_pid: Option<u32>) -> Vec<PortFile> {
    list_port_files(state_dir)
        .into_iter()
        .filter(|p| Some(p.pid) != exclude_pid)
        .filter(|p| pid_alive(p.pid))
        .collect()
}

fn list_port_files(state_dir: &Path) -> Vec<PortFile> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(state_dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("dashboard-") || !name.ends_with(".json") {
            continue;
        }
        match std::fs::read_to_string(entry.path())
            .ok()
            .and_then(|body| serde_json::from_str::<PortFile>(&body).ok())
        {
            Some(port_file) => found.push(port_file),
            None => log::warn!("dashboard: unreadable port file {}", name),
        }
    }
    found
}

/// Signal-0 style liveness probe.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Handle to a running dashboard server.
pub struct DashboardHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    state_dir: PathBuf,
}

impl DashboardHandle {
    /// Stop the server and remove the port file.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        remove_port_file(&self.state_dir);
    }
}

impl Drop for DashboardHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
    sse: broadcast::Sender<SseFrame>,
}

#[derive(Clone, Debug)]
struct SseFrame {
    event: String,
    data: String,
}

/// Bind (with retries), start serving, and start the SSE pump.
pub async fn start(manager: Arc<Manager>) -> Result<DashboardHandle, Box<dyn Error + Send + Sync>> {
    let preferred = manager.config().dashboard_port;
    let state_dir = manager.config().state_dir();

    let mut bound = None;
    for offset in 0..=BIND_RETRIES {
        let port = preferred + offset;
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                bound = Some((listener, port));
                break;
            }
            Err(e) => log::debug!("dashboard: port {} unavailable: {}", port, e),
        }
    }
    let (listener, port) = bound.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no free port in {}..={}", preferred, preferred + BIND_RETRIES),
        )
    })?;

    let (sse_tx, _) = broadcast::channel::<SseFrame>(256);

    // Bus → SSE pump. Events arrive on a synchronous handler; a task turns
    // each into an event frame followed by a fresh snapshot frame.
    let (pump_tx, mut pump_rx) = mpsc::unbounded_channel::<(String, Value)>();
    manager.bus().on_any(move |event: &ManagerEvent| {
        let _ = pump_tx.send((event.name().to_string(), event.payload()));
    });
    {
        let manager = Arc::clone(&manager);
        let sse_tx = sse_tx.clone();
        tokio::spawn(async move {
            while let Some((name, payload)) = pump_rx.recv().await {
                let _ = sse_tx.send(SseFrame {
                    event: name,
                    data: payload.to_string(),
                });
                let snapshot = manager.snapshot().await;
                let _ = sse_tx.send(SseFrame {
                    event: "snapshot".to_string(),
                    data: snapshot.to_string(),
                });
            }
        });
    }

    let state = AppState {
        manager: Arc::clone(&manager),
        sse: sse_tx,
    };
    let app = routes(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            log::error!("dashboard: server error: {}", e);
        }
    });

    write_port_file(&state_dir, port)?;
    manager.bus().emit(&ManagerEvent::ServerStarted {
        port,
        pid: std::process::id(),
    });
    log::info!("dashboard: listening on http://127.0.0.1:{}", port);

    Ok(DashboardHandle {
        port,
        shutdown: Some(shutdown_tx),
        state_dir,
    })
}

fn routes(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/events", get(get_events))
        .route("/api/automation", get(automation_list).post(automation_create))
        .route(
            "/api/automation/{id}",
            get(automation_get)
                .put(automation_update)
                .delete(automation_delete),
        )
        .route("/api/automation/{id}/toggle", post(automation_toggle))
        .route("/api/automation/{id}/trigger", post(automation_trigger))
        .route("/api/workspaces", get(workspaces_list).post(workspaces_add))
        .route(
            "/api/workspaces/{path}",
            get(workspaces_get).delete(workspaces_remove),
        )
        .route("/api/workspace-history", get(workspace_history))
        .route("/api/workspace-history/{path}", get(workspace_history_one))
        .route(
            "/api/messages",
            get(messages_read).post(messages_send).delete(messages_delete),
        )
        .route("/api/messages/channels", get(messages_channels))
        .route("/api/messages/stats", get(messages_stats))
        .route("/api/messages/ack", post(messages_ack))
        .route("/api/messages/inbound", post(messages_inbound))
        .route(
            "/api/messages/by-id/{id}",
            get(message_get).put(message_update),
        )
        .route("/api/messages/{channel}", get(messages_in_channel))
        .with_state(state)
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn not_found(detail: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": detail.to_string() })))
}

fn bad_request(detail: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": detail.to_string() })),
    )
}

async fn get_snapshot(State(state): State<AppState>) -> Json<Value> {
    Json(state.manager.snapshot().await)
}

async fn get_events(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let rx = state.sse.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|frame| {
        frame
            .ok()
            .map(|f| Ok(SseEvent::default().event(f.event).data(f.data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Automation ───────────────────────────────────────────────────────────

async fn automation_list(State(state): State<AppState>) -> Json<Value> {
    let rules = state.manager.automation().list_rules(None).await;
    Json(json!({ "rules": rules }))
}

async fn automation_create(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let input = serde_json::from_value(body).map_err(bad_request)?;
    let rule = state
        .manager
        .automation()
        .register_rule(input)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({ "rule": rule })))
}

async fn automation_get(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    match state.manager.automation().get_rule(&id).await {
        Some(rule) => Ok(Json(json!({ "rule": rule }))),
        None => Err(not_found(format!("unknown automation rule '{}'", id))),
    }
}

async fn automation_update(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    let patch = serde_json::from_value(body).map_err(bad_request)?;
    let rule = state
        .manager
        .automation()
        .update_rule(&id, patch)
        .await
        .map_err(not_found)?;
    Ok(Json(json!({ "rule": rule })))
}

async fn automation_delete(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    state
        .manager
        .automation()
        .remove_rule(&id)
        .await
        .map_err(not_found)?;
    Ok(Json(json!({ "removed": id })))
}

async fn automation_toggle(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    let automation = state.manager.automation();
    let rule = automation
        .get_rule(&id)
        .await
        .ok_or_else(|| not_found(format!("unknown automation rule '{}'", id)))?;
    automation
        .set_rule_enabled(&id, !rule.enabled)
        .await
        .map_err(not_found)?;
    Ok(Json(json!({ "id": id, "enabled": !rule.enabled })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct TriggerBody {
    test_data: Value,
    dry_run: bool,
}

async fn automation_trigger(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<TriggerBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let execution = state
        .manager
        .automation()
        .trigger_rule(&id, body.test_data, body.dry_run)
        .await
        .map_err(not_found)?;
    Ok(Json(json!({ "execution": execution })))
}

// ── Workspaces ───────────────────────────────────────────────────────────

async fn workspaces_list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "workspaces": state.manager.workspaces().status().await }))
}

#[derive(Deserialize)]
struct WorkspaceBody {
    path: String,
}

async fn workspaces_add(
    State(state): State<AppState>,
    Json(body): Json<WorkspaceBody>,
) -> ApiResult {
    let info = state
        .manager
        .workspaces()
        .monitor(&body.path)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({ "workspace": info })))
}

async fn workspaces_get(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult {
    match state.manager.workspaces().get(&path).await {
        Some(info) => Ok(Json(json!({ "workspace": info }))),
        None => Err(not_found(format!("workspace not monitored: {}", path))),
    }
}

async fn workspaces_remove(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult {
    state
        .manager
        .workspaces()
        .stop(&path)
        .await
        .map_err(not_found)?;
    Ok(Json(json!({ "stopped": path })))
}

async fn workspace_history(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "history": state.manager.workspaces().history(None).await }))
}

async fn workspace_history_one(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Json<Value> {
    Json(json!({ "history": state.manager.workspaces().history(Some(&path)).await }))
}

// ── Messages ─────────────────────────────────────────────────────────────

async fn messages_read(
    State(state): State<AppState>,
    Query(opts): Query<ReadOptions>,
) -> Json<Value> {
    Json(json!({ "messages": state.manager.mailbox().read(opts).await }))
}

async fn messages_send(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult {
    let opts: SendOptions = serde_json::from_value(body).map_err(bad_request)?;
    let id = state.manager.mailbox().send(opts).await;
    Ok(Json(json!({ "messageId": id })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DeleteBody {
    all: bool,
    channel: Option<String>,
    message_ids: Option<Vec<String>>,
}

async fn messages_delete(
    State(state): State<AppState>,
    Json(body): Json<DeleteBody>,
) -> ApiResult {
    let mailbox = state.manager.mailbox();
    let removed = if body.all {
        mailbox.purge_all().await
    } else if let Some(channel) = body.channel {
        mailbox.purge_channel(&channel).await
    } else if let Some(ids) = body.message_ids {
        mailbox.delete_messages(&ids).await
    } else {
        return Err(bad_request("body must set one of all/channel/messageIds"));
    };
    Ok(Json(json!({ "removed": removed })))
}

async fn messages_channels(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "channels": state.manager.mailbox().list_channels().await }))
}

async fn messages_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.manager.mailbox().stats().await))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckBody {
    message_ids: Vec<String>,
    reader: String,
}

async fn messages_ack(State(state): State<AppState>, Json(body): Json<AckBody>) -> Json<Value> {
    let acked = state
        .manager
        .mailbox()
        .ack(&body.message_ids, &body.reader)
        .await;
    Json(json!({ "acked": acked }))
}

async fn messages_inbound(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult {
    let message = serde_json::from_value(body).map_err(bad_request)?;
    let stored = state.manager.mailbox().receive_inbound(message).await;
    Ok(Json(json!({ "stored": stored })))
}

async fn message_get(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult {
    match state.manager.mailbox().get_by_id(&id).await {
        Some(message) => Ok(Json(json!({ "message": message }))),
        None => Err(not_found(format!("unknown message '{}'", id))),
    }
}

async fn message_update(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    let patch: MessagePatch = serde_json::from_value(body).map_err(bad_request)?;
    let message = state
        .manager
        .mailbox()
        .update_message(&id, patch)
        .await
        .map_err(not_found)?;
    Ok(Json(json!({ "message": message })))
}

#[derive(Deserialize)]
struct ChannelQuery {
    #[serde(default = "admin_reader")]
    reader: String,
}

fn admin_reader() -> String {
    "*".to_string()
}

async fn messages_in_channel(
    State(state): State<AppState>,
    AxumPath(channel): AxumPath<String>,
    Query(query): Query<ChannelQuery>,
) -> Json<Value> {
    let messages = state
        .manager
        .mailbox()
        .read(ReadOptions {
            channel: Some(channel),
            reader: query.reader,
            unread_only: false,
            include_read: true,
            mark_read: false,
            limit: None,
        })
        .await;
    Json(json!({ "messages": messages }))
}
