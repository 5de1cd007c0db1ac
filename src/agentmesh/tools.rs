//! Transport-agnostic tool surface.
//!
//! Every named tool operation maps onto one manager call. Adapters (stdio
//! framing, HTTP, whatever the host embeds) hand this dispatcher a tool
//! name plus JSON arguments and get back either a structured JSON result or
//! the uniform error envelope `{error, tool, expectedSchema}` — the
//! `expectedSchema` names the fields the tool wanted, so a caller can
//! self-correct without documentation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};

use crate::agentmesh::mailbox::{MessagePatch, ReadOptions, SendOptions};
use crate::agentmesh::manager::Manager;
use crate::agentmesh::registry::AgentState;
use crate::agentmesh::router::{invoke_agent, Priority, TaskRequest};
use crate::agentmesh::provider::DEFAULT_TIMEOUT_MS;

/// The uniform tool error envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub error: String,
    pub tool: String,
    pub expected_schema: Value,
}

impl ToolError {
    fn new(tool: &str, schema: Value, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            tool: tool.to_string(),
            expected_schema: schema,
        }
    }
}

/// Routes tool calls onto a [`Manager`].
///
/// Holds a weak handle so an embedded tool adapter can outlive a manager
/// shutdown gracefully: calls after shutdown return the error envelope
/// instead of keeping the manager alive.
pub struct ToolDispatcher {
    manager: Weak<Manager>,
}

impl ToolDispatcher {
    pub fn new(manager: Weak<Manager>) -> Self {
        Self { manager }
    }

    /// Every tool name this dispatcher answers to.
    pub fn tool_names() -> &'static [&'static str] {
        &[
            "spawn_agent",
            "stop_agent",
            "list_agents",
            "agent_status",
            "get_agent",
            "update_agent",
            "stop_all",
            "register_skill",
            "get_skill",
            "update_skill",
            "remove_skill",
            "list_skills",
            "assign_task",
            "send_prompt",
            "list_task_history",
            "get_metrics",
            "create_automation",
            "get_automation",
            "update_automation",
            "list_automations",
            "remove_automation",
            "toggle_automation",
            "trigger_automation",
            "automation_status",
            "send_message",
            "read_messages",
            "list_channels",
            "ack_messages",
            "message_stats",
            "get_message",
            "update_message",
            "purge_messages",
            "cross_repo_dispatch",
            "cross_repo_batch_dispatch",
            "cross_repo_status",
            "cross_repo_history",
            "cross_repo_cancel",
            "monitor_workspace",
            "stop_monitor",
            "monitor_status",
            "mine_sessions",
            "get_workspace",
            "list_workspace_history",
        ]
    }

    /// Dispatch one tool call.
    pub async fn handle(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| ToolError::new(tool, Value::Null, "manager has shut down"))?;
        match tool {
            // ── Agents ───────────────────────────────────────────────────
            "spawn_agent" => {
                let schema = json!({ "id": "string", "name": "string", "provider": "string",
                                     "model": "string", "transport": "stdio|tcp|http" });
                let config = parse(tool, &schema, args)?;
                manager
                    .registry()
                    .register(config)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "registered": true }))
            }
            "stop_agent" => {
                let schema = json!({ "agentId": "string" });
                let id = req_str(tool, &schema, &args, "agentId")?;
                manager
                    .registry()
                    .set_state(&id, AgentState::Stopped, None)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "stopped": id }))
            }
            "list_agents" => Ok(to_value(&manager.registry().get_all().await)),
            "agent_status" => {
                let schema = json!({ "agentId": "string" });
                let id = req_str(tool, &schema, &args, "agentId")?;
                let health = manager
                    .registry()
                    .get_health(&id)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&health))
            }
            "get_agent" => {
                let schema = json!({ "agentId": "string" });
                let id = req_str(tool, &schema, &args, "agentId")?;
                match manager.registry().get(&id).await {
                    Some(instance) => Ok(to_value(&instance)),
                    None => Err(ToolError::new(tool, schema, format!("unknown agent '{}'", id))),
                }
            }
            "update_agent" => {
                let schema = json!({ "agentId": "string", "...": "partial AgentConfig fields" });
                let (id, rest) = take_id(tool, &schema, args, "agentId")?;
                let patch = parse(tool, &schema, Value::Object(rest))?;
                let instance = manager
                    .registry()
                    .update(&id, patch)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&instance))
            }
            "stop_all" => {
                let stopped = manager.registry().stop_all().await;
                Ok(json!({ "stopped": stopped }))
            }

            // ── Skills ───────────────────────────────────────────────────
            "register_skill" | "update_skill" => {
                let schema = json!({ "id": "string", "name": "string",
                                     "promptTemplate": "string", "strategy": "string" });
                let skill = parse(tool, &schema, args)?;
                manager
                    .skills()
                    .register(skill)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "registered": true }))
            }
            "get_skill" => {
                let schema = json!({ "skillId": "string" });
                let id = req_str(tool, &schema, &args, "skillId")?;
                match manager.skills().get(&id).await {
                    Some(skill) => Ok(to_value(&skill)),
                    None => Err(ToolError::new(tool, schema, format!("unknown skill '{}'", id))),
                }
            }
            "remove_skill" => {
                let schema = json!({ "skillId": "string" });
                let id = req_str(tool, &schema, &args, "skillId")?;
                manager
                    .skills()
                    .remove(&id)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "removed": id }))
            }
            "list_skills" => {
                let category = opt_str(&args, "category");
                match opt_str(&args, "search") {
                    Some(keywords) => Ok(to_value(&manager.skills().search(&keywords).await)),
                    None => Ok(to_value(
                        &manager.skills().list(category.as_deref()).await,
                    )),
                }
            }

            // ── Tasks ────────────────────────────────────────────────────
            "assign_task" => {
                let schema = json!({ "skillId": "string", "params": "object?",
                                     "priority": "critical|high|normal|low?" });
                let skill_id = req_str(tool, &schema, &args, "skillId")?;
                let params = params_from(args.get("params"));
                let mut request = TaskRequest::new(skill_id, params);
                if let Some(priority) = args.get("priority") {
                    request.priority = serde_json::from_value::<Priority>(priority.clone())
                        .map_err(|e| ToolError::new(tool, schema.clone(), e.to_string()))?;
                }
                let result = manager
                    .router()
                    .route(request)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&result))
            }
            "send_prompt" => {
                let schema = json!({ "agentId": "string", "prompt": "string",
                                     "maxTokens": "number?", "timeoutMs": "number?" });
                let id = req_str(tool, &schema, &args, "agentId")?;
                let prompt = req_str(tool, &schema, &args, "prompt")?;
                let instance = manager
                    .registry()
                    .get(&id)
                    .await
                    .ok_or_else(|| {
                        ToolError::new(tool, schema.clone(), format!("unknown agent '{}'", id))
                    })?;
                let max_tokens = args
                    .get("maxTokens")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u32);
                let timeout_ms = args
                    .get("timeoutMs")
                    .and_then(|v| v.as_u64())
                    .or(instance.config.timeout_ms)
                    .unwrap_or(DEFAULT_TIMEOUT_MS);
                let response = invoke_agent(
                    Arc::clone(manager.registry()),
                    Arc::clone(manager.providers()),
                    instance,
                    prompt,
                    max_tokens,
                    timeout_ms,
                )
                .await;
                Ok(to_value(&response))
            }
            "list_task_history" => {
                let limit = args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
                Ok(to_value(&manager.router().history(limit).await))
            }
            "get_metrics" => {
                let metrics = manager.router().metrics().await;
                Ok(json!({ "router": metrics }))
            }

            // ── Automation ───────────────────────────────────────────────
            "create_automation" => {
                let schema = json!({ "matcher": { "events": ["string"] }, "skillId": "string" });
                let input = parse(tool, &schema, args)?;
                let rule = manager
                    .automation()
                    .register_rule(input)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&rule))
            }
            "get_automation" => {
                let schema = json!({ "ruleId": "string" });
                let id = req_str(tool, &schema, &args, "ruleId")?;
                match manager.automation().get_rule(&id).await {
                    Some(rule) => Ok(to_value(&rule)),
                    None => Err(ToolError::new(tool, schema, format!("unknown rule '{}'", id))),
                }
            }
            "update_automation" => {
                let schema = json!({ "ruleId": "string", "...": "partial rule fields" });
                let (id, rest) = take_id(tool, &schema, args, "ruleId")?;
                let patch = parse(tool, &schema, Value::Object(rest))?;
                let rule = manager
                    .automation()
                    .update_rule(&id, patch)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&rule))
            }
            "list_automations" => {
                let filter = serde_json::from_value(args).unwrap_or_default();
                Ok(to_value(
                    &manager.automation().list_rules(Some(filter)).await,
                ))
            }
            "remove_automation" => {
                let schema = json!({ "ruleId": "string" });
                let id = req_str(tool, &schema, &args, "ruleId")?;
                manager
                    .automation()
                    .remove_rule(&id)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "removed": id }))
            }
            "toggle_automation" => {
                let schema = json!({ "ruleId": "string", "enabled": "bool?" });
                let id = req_str(tool, &schema, &args, "ruleId")?;
                let automation = manager.automation();
                let enabled = match args.get("enabled").and_then(|v| v.as_bool()) {
                    Some(enabled) => enabled,
                    None => {
                        let rule = automation.get_rule(&id).await.ok_or_else(|| {
                            ToolError::new(tool, schema.clone(), format!("unknown rule '{}'", id))
                        })?;
                        !rule.enabled
                    }
                };
                automation
                    .set_rule_enabled(&id, enabled)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "ruleId": id, "enabled": enabled }))
            }
            "trigger_automation" => {
                let schema = json!({ "ruleId": "string", "testData": "object?", "dryRun": "bool?" });
                let id = req_str(tool, &schema, &args, "ruleId")?;
                let test_data = args.get("testData").cloned().unwrap_or(json!({}));
                let dry_run = args.get("dryRun").and_then(|v| v.as_bool()).unwrap_or(false);
                let execution = manager
                    .automation()
                    .trigger_rule(&id, test_data, dry_run)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&execution))
            }
            "automation_status" => Ok(manager.automation().get_status().await),

            // ── Messaging ────────────────────────────────────────────────
            "send_message" => {
                let schema = json!({ "channel": "string", "sender": "string", "body": "string",
                                     "recipients": ["string?"], "ttlSeconds": "number?",
                                     "persistent": "bool?" });
                let opts: SendOptions = parse(tool, &schema, args)?;
                let id = manager.mailbox().send(opts).await;
                Ok(json!({ "messageId": id }))
            }
            "read_messages" => {
                let schema = json!({ "reader": "string", "channel": "string?",
                                     "unreadOnly": "bool?", "markRead": "bool?" });
                let opts: ReadOptions = parse(tool, &schema, args)?;
                Ok(to_value(&manager.mailbox().read(opts).await))
            }
            "list_channels" => Ok(to_value(&manager.mailbox().list_channels().await)),
            "ack_messages" => {
                let schema = json!({ "messageIds": ["string"], "reader": "string" });
                let reader = req_str(tool, &schema, &args, "reader")?;
                let ids = str_list(tool, &schema, &args, "messageIds")?;
                let acked = manager.mailbox().ack(&ids, &reader).await;
                Ok(json!({ "acked": acked }))
            }
            "message_stats" => Ok(to_value(&manager.mailbox().stats().await)),
            "get_message" => {
                let schema = json!({ "messageId": "string" });
                let id = req_str(tool, &schema, &args, "messageId")?;
                match manager.mailbox().get_by_id(&id).await {
                    Some(message) => Ok(to_value(&message)),
                    None => Err(ToolError::new(tool, schema, format!("unknown message '{}'", id))),
                }
            }
            "update_message" => {
                let schema = json!({ "messageId": "string", "...": "partial message fields" });
                let (id, rest) = take_id(tool, &schema, args, "messageId")?;
                let patch: MessagePatch = parse(tool, &schema, Value::Object(rest))?;
                let message = manager
                    .mailbox()
                    .update_message(&id, patch)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&message))
            }
            "purge_messages" => {
                let schema = json!({ "all": "bool?", "channel": "string?", "messageIds": ["string?"] });
                let mailbox = manager.mailbox();
                let removed = if args.get("all").and_then(|v| v.as_bool()).unwrap_or(false) {
                    mailbox.purge_all().await
                } else if let Some(channel) = opt_str(&args, "channel") {
                    mailbox.purge_channel(&channel).await
                } else if args.get("messageIds").is_some() {
                    let ids = str_list(tool, &schema, &args, "messageIds")?;
                    mailbox.delete_messages(&ids).await
                } else {
                    return Err(ToolError::new(
                        tool,
                        schema,
                        "one of all/channel/messageIds is required",
                    ));
                };
                Ok(json!({ "removed": removed }))
            }

            // ── Cross-repo ───────────────────────────────────────────────
            "cross_repo_dispatch" => {
                let schema = json!({ "repoPath": "string", "prompt": "string",
                                     "provider": "string", "timeoutMs": "number?" });
                let request = parse(tool, &schema, args)?;
                let id = manager
                    .crossrepo()
                    .dispatch(request)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "dispatchId": id }))
            }
            "cross_repo_batch_dispatch" => {
                let schema = json!({ "requests": [{ "repoPath": "string", "prompt": "string",
                                                    "provider": "string" }] });
                let requests = args
                    .get("requests")
                    .cloned()
                    .ok_or_else(|| ToolError::new(tool, schema.clone(), "missing field 'requests'"))?;
                let requests = serde_json::from_value(requests)
                    .map_err(|e| ToolError::new(tool, schema.clone(), e.to_string()))?;
                let outcomes = manager.crossrepo().batch_dispatch(requests).await;
                let outcomes: Vec<Value> = outcomes
                    .into_iter()
                    .map(|o| match o {
                        Ok(id) => json!({ "dispatchId": id }),
                        Err(e) => json!({ "error": e.to_string() }),
                    })
                    .collect();
                Ok(json!({ "dispatches": outcomes }))
            }
            "cross_repo_status" => Ok(manager.crossrepo().status().await),
            "cross_repo_history" => {
                let limit = args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
                Ok(to_value(&manager.crossrepo().history(limit).await))
            }
            "cross_repo_cancel" => {
                let schema = json!({ "dispatchId": "string" });
                let id = req_str(tool, &schema, &args, "dispatchId")?;
                manager
                    .crossrepo()
                    .cancel(&id)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "cancelling": id }))
            }

            // ── Workspace ────────────────────────────────────────────────
            "monitor_workspace" => {
                let schema = json!({ "path": "string" });
                let path = req_str(tool, &schema, &args, "path")?;
                let info = manager
                    .workspaces()
                    .monitor(&path)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(to_value(&info))
            }
            "stop_monitor" => {
                let schema = json!({ "path": "string" });
                let path = req_str(tool, &schema, &args, "path")?;
                manager
                    .workspaces()
                    .stop(&path)
                    .await
                    .map_err(|e| ToolError::new(tool, schema, e.to_string()))?;
                Ok(json!({ "stopped": path }))
            }
            "monitor_status" => Ok(to_value(&manager.workspaces().status().await)),
            "mine_sessions" => {
                let schema = json!({ "path": "string" });
                let path = req_str(tool, &schema, &args, "path")?;
                let sessions = manager.workspaces().mine_sessions(&path).await;
                Ok(json!({ "sessions": sessions }))
            }
            "get_workspace" => {
                let schema = json!({ "path": "string" });
                let path = req_str(tool, &schema, &args, "path")?;
                match manager.workspaces().get(&path).await {
                    Some(info) => Ok(to_value(&info)),
                    None => Err(ToolError::new(
                        tool,
                        schema,
                        format!("workspace not monitored: {}", path),
                    )),
                }
            }
            "list_workspace_history" => {
                let path = opt_str(&args, "path");
                Ok(to_value(
                    &manager.workspaces().history(path.as_deref()).await,
                ))
            }

            _ => Err(ToolError::new(
                tool,
                json!({ "tools": Self::tool_names() }),
                format!("unknown tool '{}'", tool),
            )),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn parse<T: DeserializeOwned>(tool: &str, schema: &Value, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::new(tool, schema.clone(), e.to_string()))
}

fn req_str(tool: &str, schema: &Value, args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::new(tool, schema.clone(), format!("missing field '{}'", key)))
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn str_list(tool: &str, schema: &Value, args: &Value, key: &str) -> Result<Vec<String>, ToolError> {
    let list = args
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| ToolError::new(tool, schema.clone(), format!("missing field '{}'", key)))?;
    Ok(list
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect())
}

/// Pull an id field out of the args, leaving the rest as the patch body.
fn take_id(
    tool: &str,
    schema: &Value,
    args: Value,
    key: &str,
) -> Result<(String, Map<String, Value>), ToolError> {
    let mut map = match args {
        Value::Object(map) => map,
        _ => {
            return Err(ToolError::new(
                tool,
                schema.clone(),
                "arguments must be an object",
            ))
        }
    };
    let id = map
        .remove(key)
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .ok_or_else(|| ToolError::new(tool, schema.clone(), format!("missing field '{}'", key)))?;
    Ok((id, map))
}

/// Convert a JSON object into the string-valued parameter map the router
/// consumes. Non-string scalars are stringified.
pub fn params_from(value: Option<&Value>) -> std::collections::HashMap<String, String> {
    let mut params = std::collections::HashMap::new();
    if let Some(Value::Object(map)) = value {
        for (key, value) in map {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            params.insert(key.clone(), rendered);
        }
    }
    params
}
