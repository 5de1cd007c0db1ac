//! HTTP chat-completions provider.
//!
//! All four SDK-style providers (openai, anthropic, gemini, grok) are served
//! by one transport speaking the OpenAI-compatible `/chat/completions` wire
//! format; only the base URL and the API-key environment variable differ per
//! kind. An agent config's `endpoint` overrides the base URL, and its `env`
//! map may carry the key directly, which keeps per-agent credentials out of
//! the process environment.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::agentmesh::provider::{
    estimate_tokens, BillingModel, Provider, ProviderCapabilities, ProviderError, ProviderReply,
};
use crate::agentmesh::registry::{AgentConfig, ProviderKind};

pub struct HttpChatProvider {
    kind: ProviderKind,
    http: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            http: reqwest::Client::new(),
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self.kind {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            ProviderKind::Grok => "https://api.x.ai/v1",
            // The CLI kinds never reach this provider.
            _ => "http://127.0.0.1",
        }
    }

    fn api_key_env(&self) -> &'static str {
        match self.kind {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Grok => "XAI_API_KEY",
            _ => "API_KEY",
        }
    }

    fn resolve_api_key(&self, config: &AgentConfig) -> Result<String, ProviderError> {
        let env_name = self.api_key_env();
        if let Some(key) = config.env.get(env_name) {
            return Ok(key.clone());
        }
        std::env::var(env_name).map_err(|_| ProviderError::MissingApiKey(env_name.to_string()))
    }
}

#[async_trait]
impl Provider for HttpChatProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_token_counting: true,
            supports_streaming: false,
            billing_model: BillingModel::PerToken,
            supports_concurrency: true,
            supports_acp: false,
        }
    }

    async fn send_prompt(
        &self,
        config: &AgentConfig,
        prompt: &str,
        max_tokens: Option<u32>,
        timeout_ms: u64,
    ) -> Result<ProviderReply, ProviderError> {
        let api_key = self.resolve_api_key(config)?;
        let base = config
            .endpoint
            .as_deref()
            .unwrap_or_else(|| self.default_base_url())
            .trim_end_matches('/')
            .to_string();
        let url = format!("{}/chat/completions", base);

        let mut body = json!({
            "model": config.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let started = Instant::now();
        let request = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .timeout(Duration::from_millis(timeout_ms));

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(ProviderError::Timeout { timeout_ms }),
            Err(e) => return Err(ProviderError::Http(e.to_string())),
        };
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        if !status.is_success() {
            let detail = payload["error"]["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| payload.to_string());
            log::error!(
                "HttpChatProvider[{}]: {} from {}: {}",
                self.kind,
                status,
                url,
                detail
            );
            return Err(ProviderError::Http(format!("{}: {}", status, detail)));
        }

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::Malformed("response has no choices[0].message.content".to_string())
            })?;
        let reported_tokens = payload["usage"]["total_tokens"].as_u64();
        let (token_count, estimated) = match reported_tokens {
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
