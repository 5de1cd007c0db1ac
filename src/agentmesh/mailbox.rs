//! Agent mailbox: a durable, channel-addressed message bus between agents
//! (and between peer manager instances on the same host).
//!
//! Messages are at-least-once with dedup by id. Every mutation appends to
//! `messaging/messages.jsonl` (latest record per id wins on reload);
//! deletions and TTL sweeps compact the log in place.
//!
//! # Visibility
//!
//! A message is visible to reader `R` iff `"*"` is among its recipients, or
//! `R` is listed, or `R` is the sender, or `R` is the `"*"` admin reader.
//! Read state is tracked per reader in `read_by`; `unread_only` filters on
//! it and `ack` updates it without re-reading.
//!
//! # Peer forwarding
//!
//! On every local send the normalized message is POSTed, best-effort, to
//! every live peer dashboard discovered through the shared state directory.
//! Peers store unknown ids and drop duplicates, which yields at-least-once
//! cross-instance delivery without a coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::agentmesh::bus::{EventBus, ManagerEvent};
use crate::agentmesh::dashboard::discover_peers;
use crate::agentmesh::persist::JsonlLog;

/// TTL bounds for non-persistent messages, in seconds.
const TTL_MIN_SECS: u64 = 1;
const TTL_MAX_SECS: u64 = 86_400;

/// A mailbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub channel: String,
    pub sender: String,
    /// `["*"]` is a broadcast.
    pub recipients: Vec<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Clamped to `[1, 86400]`; ignored when `persistent`.
    pub ttl_seconds: u64,
    #[serde(default)]
    pub persistent: bool,
    /// Reader ids that have seen this message.
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl Message {
    /// The §4.8 visibility predicate.
    pub fn visible_to(&self, reader: &str) -> bool {
        reader == "*"
            || self.recipients.iter().any(|r| r == "*")
            || self.recipients.iter().any(|r| r == reader)
            || self.sender == reader
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        if self.persistent {
            return false;
        }
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() >= self.ttl_seconds as i64
    }
}

/// Input to [`Mailbox::send`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    pub channel: String,
    pub sender: String,
    /// Defaults to broadcast.
    #[serde(default)]
    pub recipients: Option<Vec<String>>,
    pub body: String,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Input to [`Mailbox::read`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOptions {
    #[serde(default)]
    pub channel: Option<String>,
    pub reader: String,
    #[serde(default)]
    pub unread_only: bool,
    /// Overrides `unread_only`.
    #[serde(default)]
    pub include_read: bool,
    #[serde(default)]
    pub mark_read: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Partial update applied by [`Mailbox::update_message`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    pub body: Option<String>,
    pub recipients: Option<Vec<String>>,
    pub payload: Option<Value>,
    pub persistent: Option<bool>,
}

/// Per-channel summary returned by [`Mailbox::list_channels`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub channel: String,
    pub message_count: usize,
    pub persistent_count: usize,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Aggregate counters returned by [`Mailbox::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxStats {
    pub total_messages: usize,
    pub channels: usize,
    pub persistent_messages: usize,
    pub broadcast_messages: usize,
}

#[derive(Debug)]
pub enum MailboxError {
    NotFound(String),
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxError::NotFound(id) => write!(f, "unknown message '{}'", id),
        }
    }
}

impl Error for MailboxError {}

/// The durable message log.
pub struct Mailbox {
    self_weak: Weak<Mailbox>,
    messages: RwLock<Vec<Message>>,
    log: JsonlLog,
    bus: Arc<EventBus>,
    http: reqwest::Client,
    /// Shared state directory used for peer discovery.
    state_dir: PathBuf,
    self_pid: u32,
}

impl Mailbox {
    pub fn new(
        log_path: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let log = JsonlLog::new(log_path);
        let state_dir = state_dir.into();
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            messages: RwLock::new(Vec::new()),
            log,
            bus,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .unwrap_or_default(),
            state_dir,
            self_pid: std::process::id(),
        })
    }

    /// Load the persisted log (latest record per id) and drop anything that
    /// expired while the manager was down.
    pub async fn load(&self) -> usize {
        let loaded = self
            .log
            .load::<Message, _>(|m| m.id.clone())
            .unwrap_or_else(|e| {
                log::error!("Mailbox: failed to load message log: {}", e);
                Vec::new()
            });
        let now = Utc::now();
        let live: Vec<Message> = loaded.into_iter().filter(|m| !m.expired(now)).collect();
        let count = live.len();
        *self.messages.write().await = live;
        count
    }

    /// Accept a new message, persist it, and forward it to peers.
    pub async fn send(&self, opts: SendOptions) -> String {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            channel: opts.channel,
            sender: opts.sender,
            recipients: opts
                .recipients
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| vec!["*".to_string()]),
            body: opts.body,
            created_at: Utc::now(),
            ttl_seconds: opts
                .ttl_seconds
                .unwrap_or(TTL_MAX_SECS)
                .clamp(TTL_MIN_SECS, TTL_MAX_SECS),
            persistent: opts.persistent,
            read_by: Vec::new(),
            payload: opts.payload,
        };
        let id = message.id.clone();
        self.store(message.clone()).await;
        self.forward_to_peers(message);
        id
    }

    /// Accept a message relayed by a peer instance. Known ids are dropped
    /// (at-least-once delivery, dedup by id).
    pub async fn receive_inbound(&self, message: Message) -> bool {
        {
            let messages = self.messages.read().await;
            if messages.iter().any(|m| m.id == message.id) {
                log::debug!("Mailbox: duplicate inbound message '{}' ignored", message.id);
                return false;
            }
        }
        self.store(message).await;
        true
    }

    async fn store(&self, message: Message) {
        let event = ManagerEvent::MessageReceived {
            message_id: message.id.clone(),
            channel: message.channel.clone(),
            sender: message.sender.clone(),
        };
        if let Err(e) = self.log.append(&message) {
            log::error!("Mailbox: failed to append message: {}", e);
        }
        self.messages.write().await.push(message);
        self.bus.emit(&event);
    }

    /// Best-effort POST of the normalized message to every live peer.
    fn forward_to_peers(&self, message: Message) {
        let peers = discover_peers(&self.state_dir, Some(self.self_pid));
        if peers.is_empty() {
            return;
        }
        let http = self.http.clone();
        let body = match serde_json::to_value(&message) {
            Ok(body) => body,
            Err(_) => return,
        };
        tokio::spawn(async move {
            for peer in peers {
                let url = format!("http://127.0.0.1:{}/api/messages/inbound", peer.port);
                if let Err(e) = http.post(&url).json(&body).send().await {
                    log::warn!(
                        "Mailbox: peer forward to pid {} (port {}) failed: {}",
                        peer.pid,
                        peer.port,
                        e
                    );
                }
            }
        });
    }

    /// Read messages visible to a reader, optionally marking them read.
    pub async fn read(&self, opts: ReadOptions) -> Vec<Message> {
        let mut marked = false;
        let result: Vec<Message> = {
            let mut messages = self.messages.write().await;
            let mut picked = Vec::new();
            for message in messages.iter_mut() {
                if let Some(channel) = &opts.channel {
                    if &message.channel != channel {
                        continue;
                    }
                }
                if !message.visible_to(&opts.reader) {
                    continue;
                }
                let already_read = message.read_by.iter().any(|r| r == &opts.reader);
                if opts.unread_only && !opts.include_read && already_read {
                    continue;
                }
                if opts.mark_read && !already_read {
                    message.read_by.push(opts.reader.clone());
                    marked = true;
                }
                picked.push(message.clone());
                if let Some(limit) = opts.limit {
                    if picked.len() >= limit {
                        break;
                    }
                }
            }
            if marked {
                for message in &picked {
                    if let Err(e) = self.log.append(message) {
                        log::error!("Mailbox: failed to persist read state: {}", e);
                    }
                }
            }
            picked
        };
        result
    }

    /// Mark messages read for a reader without returning them.
    pub async fn ack(&self, ids: &[String], reader: &str) -> usize {
        let mut acked = 0;
        let mut messages = self.messages.write().await;
        for message in messages.iter_mut() {
            if !ids.contains(&message.id) || !message.visible_to(reader) {
                continue;
            }
            if !message.read_by.iter().any(|r| r == reader) {
                message.read_by.push(reader.to_string());
                if let Err(e) = self.log.append(message) {
                    log::error!("Mailbox: failed to persist ack: {}", e);
                }
                acked += 1;
            }
        }
        acked
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Message> {
        self.messages.read().await.iter().find(|m| m.id == id).cloned()
    }

    pub async fn update_message(
        &self,
        id: &str,
        patch: MessagePatch,
    ) -> Result<Message, MailboxError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| MailboxError::NotFound(id.to_string()))?;
        if let Some(body) = patch.body {
            message.body = body;
        }
        if let Some(recipients) = patch.recipients {
            message.recipients = recipients;
        }
        if let Some(payload) = patch.payload {
            message.payload = Some(payload);
        }
        if let Some(persistent) = patch.persistent {
            message.persistent = persistent;
        }
        if let Err(e) = self.log.append(message) {
            log::error!("Mailbox: failed to persist update: {}", e);
        }
        Ok(message.clone())
    }

    pub async fn delete_messages(&self, ids: &[String]) -> usize {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| !ids.contains(&m.id));
        let removed = before - messages.len();
        if removed > 0 {
            self.compact(&messages);
        }
        removed
    }

    pub async fn purge_channel(&self, channel: &str) -> usize {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| m.channel != channel);
        let removed = before - messages.len();
        if removed > 0 {
            self.compact(&messages);
        }
        removed
    }

    pub async fn purge_all(&self) -> usize {
        let mut messages = self.messages.write().await;
        let removed = messages.len();
        messages.clear();
        self.compact(&messages);
        removed
    }

    /// Admin view of a channel, ignoring visibility.
    pub async fn peek_channel(&self, channel: &str) -> Vec<Message> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    pub async fn list_channels(&self) -> Vec<ChannelSummary> {
        let messages = self.messages.read().await;
        let mut by_channel: HashMap<String, ChannelSummary> = HashMap::new();
        for message in messages.iter() {
            let entry = by_channel
                .entry(message.channel.clone())
                .or_insert_with(|| ChannelSummary {
                    channel: message.channel.clone(),
                    message_count: 0,
                    persistent_count: 0,
                    last_message_at: None,
                });
            entry.message_count += 1;
            if message.persistent {
                entry.persistent_count += 1;
            }
            if entry
                .last_message_at
                .map(|t| message.created_at > t)
                .unwrap_or(true)
            {
                entry.last_message_at = Some(message.created_at);
            }
        }
        let mut summaries: Vec<ChannelSummary> = by_channel.into_values().collect();
        summaries.sort_by(|a, b| a.channel.cmp(&b.channel));
        summaries
    }

    pub async fn stats(&self) -> MailboxStats {
        let messages = self.messages.read().await;
        let channels: std::collections::HashSet<&str> =
            messages.iter().map(|m| m.channel.as_str()).collect();
        MailboxStats {
            total_messages: messages.len(),
            channels: channels.len(),
            persistent_messages: messages.iter().filter(|m| m.persistent).count(),
            broadcast_messages: messages
                .iter()
                .filter(|m| m.recipients.iter().any(|r| r == "*"))
                .count(),
        }
    }

    /// Drop expired non-persistent messages. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| !m.expired(now));
        let removed = before - messages.len();
        if removed > 0 {
            log::info!("Mailbox: swept {} expired message(s)", removed);
            self.compact(&messages);
        }
        removed
    }

    /// Start the periodic TTL sweeper. It stops on its own when the
    /// mailbox is dropped.
    pub fn start_sweeper(&self, interval_secs: u64) {
        let mailbox = self.self_weak.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match mailbox.upgrade() {
                    Some(mailbox) => {
                        mailbox.sweep_expired().await;
                    }
                    None => break,
                }
            }
        });
    }

    fn compact(&self, messages: &[Message]) {
        if let Err(e) = self.log.rewrite(messages) {
            log::error!("Mailbox: failed to compact message log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_predicate() {
        let message = Message {
            id: "m".into(),
            channel: "general".into(),
            sender: "alice".into(),
            recipients: vec!["bob".into()],
            body: "hi".into(),
            created_at: Utc::now(),
            ttl_seconds: 60,
            persistent: false,
            read_by: Vec::new(),
            payload: None,
        };
        assert!(message.visible_to("bob"));
        assert!(message.visible_to("alice")); // sender
        assert!(message.visible_to("*")); // admin
        assert!(!message.visible_to("carol"));

        let broadcast = Message {
            recipients: vec!["*".into()],
            ..message
        };
        assert!(broadcast.visible_to("carol"));
    }
}
