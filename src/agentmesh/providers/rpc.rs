//! Long-lived subprocess sessions speaking JSON-RPC 2.0 over stdio.
//!
//! Agents configured with `session = true` keep one child process alive per
//! agent id. Requests are framed as single-line JSON-RPC calls with
//! monotonic ids; responses are matched back through a pending map, each
//! entry guarded by its own timer. A timed-out request is evicted and
//! reported as an error, but the child is left running so other outstanding
//! requests can still complete. Non-JSON stdout lines (startup banners,
//! progress chatter) are discarded.
//!
//! ```text
//! send_prompt ──► {"jsonrpc":"2.0","id":7,"method":"prompt","params":{...}}\n
//!                                │ stdin
//!                        child process (per agent id)
//!                                │ stdout
//!            {"jsonrpc":"2.0","id":7,"result":{"content":"..."}}\n
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

use crate::agentmesh::provider::{
    estimate_tokens, BillingModel, Provider, ProviderCapabilities, ProviderError, ProviderReply,
};
use crate::agentmesh::providers::subprocess::resolve_executable;
use crate::agentmesh::registry::{AgentConfig, ProviderKind};

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

struct RpcSession {
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    // Held so the child is reaped with the session, not before.
    _child: Mutex<Child>,
}

impl RpcSession {
    fn spawn(config: &AgentConfig) -> Result<Arc<RpcSession>, ProviderError> {
        let binary = resolve_executable(config.binary_path.as_deref(), default_binary(config))?;
        let mut cmd = Command::new(binary);
        cmd.args(&config.cli_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::Spawn(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Spawn("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Spawn("child has no stdout".to_string()))?;

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let agent_id = config.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(value) => value,
                    Err(_) => {
                        // Banner tolerance: vendors print human chatter on
                        // stdout before settling into JSON-RPC.
                        log::debug!("RpcSession[{}]: ignoring non-JSON line", agent_id);
                        continue;
                    }
                };
                let id = match value.get("id").and_then(|v| v.as_u64()) {
                    Some(id) => id,
                    None => continue,
                };
                let sender = reader_pending.lock().unwrap().remove(&id);
                if let Some(sender) = sender {
                    let outcome = if let Some(error) = value.get("error") {
                        let message = error
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unspecified rpc error");
                        Err(message.to_string())
                    } else {
                        Ok(value.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = sender.send(outcome);
                }
            }
            // EOF: the child is gone. Fail whatever is still outstanding.
            reader_closed.store(true, Ordering::SeqCst);
            let mut pending = reader_pending.lock().unwrap();
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err("session closed".to_string()));
            }
            log::warn!("RpcSession[{}]: stdout closed, session marked dead", agent_id);
        });

        Ok(Arc::new(RpcSession {
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(0),
            closed,
            _child: Mutex::new(child),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: u64,
    ) -> Result<Value, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        {
            let mut stdin = self.stdin.lock().await;
            let line = format!("{}\n", frame);
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&id);
                return Err(ProviderError::Rpc(format!("stdin write failed: {}", e)));
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(ProviderError::Rpc(message)),
            Ok(Err(_)) => Err(ProviderError::Rpc("session closed".to_string())),
            Err(_) => {
                // Evict the stale entry; the child keeps running and other
                // requests can still complete.
                self.pending.lock().unwrap().remove(&id);
                Err(ProviderError::Timeout { timeout_ms })
            }
        }
    }
}

fn default_binary(config: &AgentConfig) -> &'static str {
    match config.provider {
        ProviderKind::ClaudeCode => "claude",
        ProviderKind::GeminiCli => "gemini",
        ProviderKind::Codex => "codex",
        _ => "sh",
    }
}

/// Session-mode provider: one JSON-RPC child per agent id.
pub struct RpcProvider {
    sessions: Mutex<HashMap<String, Arc<RpcSession>>>,
}

impl RpcProvider {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn session_for(&self, config: &AgentConfig) -> Result<Arc<RpcSession>, ProviderError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&config.id) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            sessions.remove(&config.id);
        }
        let session = RpcSession::spawn(config)?;
        sessions.insert(config.id.clone(), session.clone());
        Ok(session)
    }
}

impl Default for RpcProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for RpcProvider {
    fn kind(&self) -> ProviderKind {
        // Session routing is by the `session` flag, not the kind; the
        // concrete vendor kind lives on the agent config.
        ProviderKind::ClaudeCode
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_token_counting: false,
            supports_streaming: false,
            billing_model: BillingModel::Unknown,
            supports_concurrency: true,
            supports_acp: true,
        }
    }

    async fn send_prompt(
        &self,
        config: &AgentConfig,
        prompt: &str,
        max_tokens: Option<u32>,
        timeout_ms: u64,
    ) -> Result<ProviderReply, ProviderError> {
        let session = self.session_for(config).await?;
        let started = Instant::now();
        let params = json!({
            "prompt": prompt,
            "model": config.model,
            "maxTokens": max_tokens,
        });
        let result = session.request("prompt", params, timeout_ms).await?;

        let content = result
            .get("content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| match &result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        let (token_count, estimated) = match result.get("tokens").and_then(|t| t.as_u64()) {
            Some(tokens) => (tokens, false),
            None => (estimate_tokens(prompt) + estimate_tokens(&content), true),
        };

        Ok(ProviderReply {
            content,
            token_count,
            token_count_estimated: estimated,
            latency_ms: started.elapsed().as_millis() as u64,
            warning: None,
        })
    }
}
