//! Provider abstraction: one uniform `send_prompt` contract over every way
//! the manager can reach an LLM.
//!
//! A [`Provider`] turns (agent config, prompt) into a [`ProviderReply`]. The
//! router layers identity, cost, and success bookkeeping on top; providers
//! only report what they can observe (content, token counts, latency,
//! partial-output warnings).
//!
//! # Architecture
//!
//! ```text
//! Router ──► ProviderSet::for_agent(config)
//!               ├─ HttpChatProvider    openai / anthropic / gemini / grok
//!               ├─ CliProvider         claude-code / gemini-cli / codex (one-shot)
//!               └─ RpcProvider         subprocess JSON-RPC sessions
//! ```
//!
//! Providers that cannot report billed tokens estimate them as
//! `ceil(chars / 4)` and set [`ProviderReply::token_count_estimated`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::agentmesh::providers::http::HttpChatProvider;
use crate::agentmesh::providers::rpc::RpcProvider;
use crate::agentmesh::providers::subprocess::CliProvider;
use crate::agentmesh::registry::{AgentConfig, ProviderKind};

/// Default provider-call timeout when neither the skill nor the agent
/// config sets one.
pub const DEFAULT_TIMEOUT_MS: u64 = 180_000;

/// Minimum captured stdout (trimmed) for a timed-out subprocess call to be
/// reported as a partial success instead of a timeout error.
pub const PARTIAL_CONTENT_MIN_CHARS: usize = 20;

/// How a provider bills its calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingModel {
    PerToken,
    PremiumRequest,
    Free,
    Unknown,
}

/// Static capability descriptor used by admission and accounting logic.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub supports_token_counting: bool,
    pub supports_streaming: bool,
    pub billing_model: BillingModel,
    pub supports_concurrency: bool,
    pub supports_acp: bool,
}

/// What a provider reports back from one call.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub content: String,
    pub token_count: u64,
    /// True when `token_count` is a character-based estimate rather than a
    /// provider-reported figure.
    pub token_count_estimated: bool,
    pub latency_ms: u64,
    /// Set for partial-output-on-timeout successes.
    pub warning: Option<String>,
}

/// Errors surfaced by provider calls.
#[derive(Debug)]
pub enum ProviderError {
    /// No API key available for an HTTP provider.
    MissingApiKey(String),
    /// Transport or HTTP-status failure.
    Http(String),
    /// The provider answered with a body we could not interpret.
    Malformed(String),
    /// The child process could not be spawned.
    Spawn(String),
    /// The child exited non-zero.
    ChildFailed { code: Option<i32>, stderr: String },
    /// The call exceeded its deadline with no usable output.
    Timeout { timeout_ms: u64 },
    /// JSON-RPC level error from a session-mode agent.
    Rpc(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::MissingApiKey(env) => write!(f, "missing API key ({})", env),
            ProviderError::Http(detail) => write!(f, "provider HTTP error: {}", detail),
            ProviderError::Malformed(detail) => write!(f, "malformed provider response: {}", detail),
            ProviderError::Spawn(detail) => write!(f, "failed to spawn agent process: {}", detail),
            ProviderError::ChildFailed { code, stderr } => match code {
                Some(code) => write!(f, "agent process exited with {}: {}", code, stderr),
                None => write!(f, "agent process killed: {}", stderr),
            },
            ProviderError::Timeout { timeout_ms } => {
                write!(f, "provider call timed out after {}ms", timeout_ms)
            }
            ProviderError::Rpc(detail) => write!(f, "agent rpc error: {}", detail),
        }
    }
}

impl Error for ProviderError {}

/// Uniform contract for reaching an LLM.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which member of the closed provider set this implementation serves.
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Send one prompt on behalf of `config` and wait (up to `timeout_ms`)
    /// for the reply.
    async fn send_prompt(
        &self,
        config: &AgentConfig,
        prompt: &str,
        max_tokens: Option<u32>,
        timeout_ms: u64,
    ) -> Result<ProviderReply, ProviderError>;
}

/// Character-based token estimate for providers without usage reporting.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() + 3) / 4) as u64
}

/// The full provider table, one implementation per [`ProviderKind`], plus
/// the JSON-RPC session provider for `session = true` subprocess agents.
pub struct ProviderSet {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    rpc: Arc<RpcProvider>,
}

impl ProviderSet {
    /// Wire up the default implementations for every provider kind.
    pub fn with_defaults() -> Self {
        let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::Grok,
        ] {
            providers.insert(kind, Arc::new(HttpChatProvider::new(kind)));
        }
        for kind in [
            ProviderKind::ClaudeCode,
            ProviderKind::GeminiCli,
            ProviderKind::Codex,
        ] {
            providers.insert(kind, Arc::new(CliProvider::new(kind)));
        }
        Self {
            providers,
            rpc: Arc::new(RpcProvider::new()),
        }
    }

    /// Replace (or add) the implementation for one kind — tests install
    /// mocks through this.
    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Pick the implementation serving this agent.
    ///
    /// Session-mode subprocess agents route to the JSON-RPC session
    /// provider; everything else goes by provider kind.
    pub fn for_agent(&self, config: &AgentConfig) -> Option<Arc<dyn Provider>> {
        if config.session && config.provider.is_subprocess() {
            return Some(self.rpc.clone() as Arc<dyn Provider>);
        }
        self.providers.get(&config.provider).cloned()
    }

    pub fn capabilities_of(&self, config: &AgentConfig) -> Option<ProviderCapabilities> {
        self.for_agent(config).map(|p| p.capabilities())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn default_set_covers_every_kind() {
        let set = ProviderSet::with_defaults();
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::Grok,
            ProviderKind::ClaudeCode,
            ProviderKind::GeminiCli,
            ProviderKind::Codex,
        ] {
            assert!(set.providers.contains_key(&kind), "missing {}", kind);
        }
    }
}
