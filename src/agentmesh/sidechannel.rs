//! Index-server side channel.
//!
//! An optional key/value redundancy layer for the catalogs. When configured,
//! stores push a copy of their full catalog under a well-known key on every
//! persist, and the startup recovery ladder falls back to the last pushed
//! snapshot when both the primary file and its `.bak` shadow are unusable.
//!
//! Well-known keys: `mgr:agents:all`, `mgr:skills:all`, `mgr:rules:all`.
//!
//! All calls are best-effort with short timeouts; the side channel is a
//! recovery aid, never the source of truth.

use reqwest::StatusCode;
use serde_json::Value;
use std::error::Error;
use std::time::Duration;

/// Well-known side-channel key for the agent catalog.
pub const KEY_AGENTS: &str = "mgr:agents:all";
/// Well-known side-channel key for the skill catalog.
pub const KEY_SKILLS: &str = "mgr:skills:all";
/// Well-known side-channel key for the automation rule catalog.
pub const KEY_RULES: &str = "mgr:rules:all";

/// HTTP client for the index server's key/value surface.
pub struct IndexClient {
    base_url: String,
    http: reqwest::Client,
}

impl IndexClient {
    /// Create a client for an index server rooted at `base_url`
    /// (e.g. `http://127.0.0.1:7700`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .unwrap_or_default(),
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, urlencoding::encode(key))
    }

    /// Fetch the last snapshot stored under `key`. `Ok(None)` when the key
    /// is unknown to the server.
    pub async fn fetch(&self, key: &str) -> Result<Option<Value>, Box<dyn Error + Send + Sync>> {
        let response = self.http.get(self.key_url(key)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json().await?))
    }

    /// Store a snapshot under `key`, replacing any previous value.
    pub async fn store(&self, key: &str, value: &Value) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.http
            .put(self.key_url(key))
            .json(value)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
