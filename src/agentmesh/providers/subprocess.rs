//! One-shot subprocess CLI providers.
//!
//! The claude-code, gemini-cli, and codex kinds run the vendor CLI as a
//! child process: prompt as the final argument, stdout as the reply, child
//! lifetime = request lifetime. Stdout is captured incrementally so that a
//! call which exceeds its deadline can still return what the CLI produced:
//! if more than [`PARTIAL_CONTENT_MIN_CHARS`] trimmed characters were
//! captured, the timeout becomes a partial success carrying a warning;
//! otherwise it is a timeout error.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::agentmesh::provider::{
    estimate_tokens, BillingModel, Provider, ProviderCapabilities, ProviderError, ProviderReply,
    PARTIAL_CONTENT_MIN_CHARS,
};
use crate::agentmesh::registry::{AgentConfig, ProviderKind};

pub struct CliProvider {
    kind: ProviderKind,
}

impl CliProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self { kind }
    }

    fn default_binary(&self) -> &'static str {
        cli_binary(self.kind)
    }

    fn build_command(
        &self,
        config: &AgentConfig,
        prompt: &str,
    ) -> Result<Command, ProviderError> {
        let binary = resolve_executable(
            config.binary_path.as_deref(),
            self.default_binary(),
        )?;
        // An explicit cliArgs list replaces the vendor defaults wholesale.
        let args = if config.cli_args.is_empty() {
            one_shot_args(self.kind, &config.model)
        } else {
            config.cli_args.clone()
        };
        let mut cmd = Command::new(binary);
        cmd.args(args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_token_counting: false,
            supports_streaming: false,
            billing_model: BillingModel::PremiumRequest,
            supports_concurrency: false,
            supports_acp: false,
        }
    }

    async fn send_prompt(
        &self,
        config: &AgentConfig,
        prompt: &str,
        _max_tokens: Option<u32>,
        timeout_ms: u64,
    ) -> Result<ProviderReply, ProviderError> {
        let mut cmd = self.build_command(config, prompt)?;
        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::Spawn(format!("{}: {}", self.default_binary(), e)))?;

        // Capture stdout incrementally so a timeout can still salvage
        // partial output.
        let captured = Arc::new(StdMutex::new(Vec::<u8>::new()));
        if let Some(mut stdout) = child.stdout.take() {
            let sink = captured.clone();
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
        let mut stderr_pipe = child.stderr.take();

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match status {
            Some(Ok(status)) => {
                let content = String::from_utf8_lossy(&captured.lock().unwrap())
                    .trim()
                    .to_string();
                if status.success() {
                    Ok(ProviderReply {
                        token_count: estimate_tokens(&content) + estimate_tokens(prompt),
                        token_count_estimated: true,
                        latency_ms,
                        warning: None,
                        content,
                    })
                } else {
                    let mut stderr = String::new();
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_string(&mut stderr).await;
                    }
                    Err(ProviderError::ChildFailed {
                        code: status.code(),
                        stderr: stderr.trim().to_string(),
                    })
                }
            }
            Some(Err(e)) => Err(ProviderError::Spawn(e.to_string())),
            None => {
                // Deadline hit: reap the child, keep whatever it printed.
                let _ = child.start_kill();
                let _ = child.wait().await;
                let content = String::from_utf8_lossy(&captured.lock().unwrap())
                    .trim()
                    .to_string();
                if content.chars().count() > PARTIAL_CONTENT_MIN_CHARS {
                    log::warn!(
                        "CliProvider[{}]: timeout after {}ms, returning {} chars of partial output",
                        self.kind,
                        timeout_ms,
                        content.len()
                    );
                    Ok(ProviderReply {
                        token_count: estimate_tokens(&content) + estimate_tokens(prompt),
                        token_count_estimated: true,
                        latency_ms,
                        warning: Some(format!(
                            "partial output: subprocess timed out after {}ms",
                            timeout_ms
                        )),
                        content,
                    })
                } else {
                    Err(ProviderError::Timeout { timeout_ms })
                }
            }
        }
    }
}

/// Default executable name for a subprocess provider kind.
pub(crate) fn cli_binary(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::ClaudeCode => "claude",
        ProviderKind::GeminiCli => "gemini",
        ProviderKind::Codex => "codex",
        _ => "sh",
    }
}

/// Vendor-specific one-shot arguments, prompt excluded.
pub(crate) fn one_shot_args(kind: ProviderKind, model: &str) -> Vec<String> {
    match kind {
        ProviderKind::ClaudeCode => {
            vec!["--print".into(), "--model".into(), model.to_string()]
        }
        ProviderKind::GeminiCli => {
            vec!["--model".into(), model.to_string(), "--prompt".into()]
        }
        ProviderKind::Codex => vec![
            "exec".into(),
            "--color".into(),
            "never".into(),
            "--skip-git-repo-check".into(),
            "--model".into(),
            model.to_string(),
        ],
        _ => Vec::new(),
    }
}

/// Locate the CLI binary: explicit config path, then `$PATH`, then the
/// usual install locations.
pub(crate) fn resolve_executable(
    configured: Option<&str>,
    name: &str,
) -> Result<PathBuf, ProviderError> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(ProviderError::Spawn(format!(
            "configured binaryPath is not executable: {}",
            path.display()
        )));
    }

    if let Some(path_value) = std::env::var_os("PATH") {
        for entry in std::env::split_paths(&path_value) {
            let candidate = entry.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    let mut fallbacks = vec![
        PathBuf::from("/opt/homebrew/bin").join(name),
        PathBuf::from("/usr/local/bin").join(name),
        PathBuf::from("/usr/bin").join(name),
    ];
    if let Some(home) = dirs::home_dir() {
        fallbacks.push(home.join(".local").join("bin").join(name));
    }
    for candidate in fallbacks {
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    Err(ProviderError::Spawn(format!(
        "could not locate '{}' in PATH or fallback locations",
        name
    )))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::agentmesh::registry::Transport;

    fn cli_config(binary: &str, args: &[&str]) -> AgentConfig {
        AgentConfig {
            id: "cli".into(),
            name: "CLI".into(),
            provider: ProviderKind::ClaudeCode,
            model: "test".into(),
            transport: Transport::Stdio,
            endpoint: None,
            tags: Vec::new(),
            can_mutate: false,
            cost_multiplier: 1.0,
            max_concurrency: 1,
            timeout_ms: None,
            binary_path: Some(binary.to_string()),
            cli_args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            session: false,
        }
    }

    // `sh -c 'echo ...'` stands in for a vendor CLI: the provider only cares
    // about spawn/capture/timeout mechanics.
    #[tokio::test]
    #[cfg(unix)]
    async fn captures_stdout_of_a_fast_child() {
        let provider = CliProvider::new(ProviderKind::ClaudeCode);
        let config = cli_config("/bin/sh", &["-c", "echo hello from the cli #"]);
        // The trailing "#" comments out the provider-appended prompt args.
        let reply = provider
            .send_prompt(&config, "ignored", None, 5_000)
            .await
            .unwrap();
        assert!(reply.content.contains("hello from the cli"));
        assert!(reply.token_count_estimated);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn timeout_with_partial_output_is_a_success() {
        let provider = CliProvider::new(ProviderKind::ClaudeCode);
        let config = cli_config(
            "/bin/sh",
            &["-c", "echo this is a long partial answer chunk; sleep 30 #"],
        );
        let reply = provider
            .send_prompt(&config, "ignored", None, 700)
            .await
            .unwrap();
        assert!(reply.content.contains("partial answer"));
        assert!(reply.warning.is_some());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn timeout_without_output_is_an_error() {
        let provider = CliProvider::new(ProviderKind::ClaudeCode);
        let config = cli_config("/bin/sh", &["-c", "sleep 30 #"]);
        let err = provider
            .send_prompt(&config, "ignored", None, 500)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }
}
