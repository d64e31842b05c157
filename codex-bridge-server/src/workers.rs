//! Per-tool-call worker bodies. Each spawned as its own task by the
//! dispatcher (C6); every path here ends in a `CallToolResult`, never a
//! raised error — `BridgeError`s from upstream calls are converted to
//! `isError:true` results at this boundary, per the error-handling design.

use crate::state::BRIDGE_VERSION;
use crate::state::BridgeState;
use codex_bridge_core::SessionStore;
use codex_bridge_core::cancel::CancelSignal;
use codex_bridge_core::policy;
use codex_bridge_core::session::SessionRecord;
use mcp_types::CallToolResult;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const OVERALL_DEFAULT_MS: i64 = 600_000;
const OVERALL_MIN_MS: i64 = 1_000;
const OVERALL_MAX_MS: i64 = 3_600_000;
const STARTUP_DEFAULT_MS: i64 = 5_000;
const STARTUP_MIN_MS: i64 = 100;
const STARTUP_MAX_MS: i64 = 60_000;
const SESSION_RECOVERY_WINDOW: Duration = Duration::from_millis(500);
const READ_ROLLOUT_DEFAULT_LINES: i64 = 100;
const READ_ROLLOUT_MIN_LINES: i64 = 1;
const READ_ROLLOUT_MAX_LINES: i64 = 500;

pub async fn dispatch_tool_call(
    state: Arc<BridgeState>,
    name: String,
    arguments: Option<Value>,
    cancel: CancelSignal,
) -> CallToolResult {
    let mut args = match arguments {
        Some(Value::Object(map)) => map,
        Some(_) => return CallToolResult::error("'arguments' must be a JSON object"),
        None => Map::new(),
    };

    match name.as_str() {
        "codex" => handle_codex(&state, &mut args, &cancel).await,
        "codex-reply" => handle_codex_reply(&state, &mut args, &cancel).await,
        "codex-bridge-info" => CallToolResult::structured(info_payload(&state).await),
        "codex-bridge-options" => CallToolResult::structured(options_payload(&state)),
        "codex-bridge-sessions" => CallToolResult::structured(sessions_payload(&state, &args)),
        "codex-bridge-session" => handle_session_lookup(&state, &args),
        "codex-bridge-name-session" => handle_name_session(&state, &args),
        "codex-bridge-delete-session" => handle_delete_session(&state, &args),
        "codex-bridge-read-rollout" => handle_read_rollout(&state, &args),
        "codex-bridge-export-session" => handle_export_session(&state, &args),
        other => CallToolResult::error(format!("unknown tool: {other}")),
    }
}

fn pop_i64(args: &mut Map<String, Value>, key: &str) -> Option<i64> {
    args.remove(key).and_then(|v| v.as_i64())
}

fn pop_string(args: &mut Map<String, Value>, key: &str) -> Option<String> {
    args.remove(key)
        .and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn clamp_timeout_ms(value: Option<i64>, default_ms: i64, min_ms: i64, max_ms: i64) -> Duration {
    let ms = match value {
        None => default_ms,
        Some(ms) if ms <= 0 => min_ms,
        Some(ms) if ms > max_ms => max_ms,
        Some(ms) => ms,
    };
    Duration::from_millis(ms as u64)
}

async fn handle_codex(
    state: &BridgeState,
    args: &mut Map<String, Value>,
    cancel: &CancelSignal,
) -> CallToolResult {
    if !matches!(args.get("prompt"), Some(Value::String(_))) {
        return CallToolResult::error("missing required argument 'prompt'");
    }

    let timeout = clamp_timeout_ms(
        pop_i64(args, "timeoutMs"),
        OVERALL_DEFAULT_MS,
        OVERALL_MIN_MS,
        OVERALL_MAX_MS,
    );
    let startup_timeout = clamp_timeout_ms(
        pop_i64(args, "startupTimeoutMs"),
        STARTUP_DEFAULT_MS,
        STARTUP_MIN_MS,
        STARTUP_MAX_MS,
    );
    let requested_name = pop_string(args, "name");
    let task_type = policy::TaskType::parse(pop_string(args, "taskType").as_deref());

    let observed = state.store.list(None, None).data;
    let auth_mode = policy::infer_auth_mode(observed.iter().filter_map(|r| r.model.as_deref()));
    let catalogue = policy::model_catalogue(auth_mode, &observed);
    let requested_model = args.get("model").and_then(Value::as_str).map(str::to_string);
    let resolution = policy::resolve_model(requested_model.as_deref(), task_type, &catalogue);
    let model_warning = resolution.warning;
    args.insert("model".to_string(), Value::String(resolution.model));

    policy::apply_defaults(args);

    let upstream = match state.ensure_upstream().await {
        Ok(upstream) => upstream,
        Err(err) => return CallToolResult::error(err.as_tool_message()),
    };

    let (upstream_id, outcome) = upstream
        .call_tool(
            "codex",
            Value::Object(args.clone()),
            timeout,
            Some(cancel),
            |_id| {},
        )
        .await;
    let output = match outcome {
        Ok(value) => value,
        Err(err) => return CallToolResult::error(err.as_tool_message()),
    };

    let session = match upstream
        .await_session_for_request(upstream_id, startup_timeout, Some(cancel))
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => {
            return CallToolResult::error(
                "no session_configured event observed before the startup timeout; this conversation id is not continuable",
            );
        }
        Err(err) => return CallToolResult::error(err.as_tool_message()),
    };

    state.store.add(session.clone());
    let session = match requested_name {
        Some(name) => state
            .store
            .update_name(&session.conversation_id, name)
            .unwrap_or(session),
        None => session,
    };

    CallToolResult::structured(json!({
        "conversationId": session.conversation_id,
        "output": output,
        "session": session.to_payload(),
        "modelWarning": model_warning,
    }))
}

async fn handle_codex_reply(
    state: &BridgeState,
    args: &mut Map<String, Value>,
    cancel: &CancelSignal,
) -> CallToolResult {
    let conversation_id = match pop_string(args, "conversationId") {
        Some(id) => id,
        None => return CallToolResult::error("missing required argument 'conversationId'"),
    };
    if !matches!(args.get("prompt"), Some(Value::String(_))) {
        return CallToolResult::error("missing required argument 'prompt'");
    }
    let timeout = clamp_timeout_ms(
        pop_i64(args, "timeoutMs"),
        OVERALL_DEFAULT_MS,
        OVERALL_MIN_MS,
        OVERALL_MAX_MS,
    );

    let upstream = match state.ensure_upstream().await {
        Ok(upstream) => upstream,
        Err(err) => return CallToolResult::error(err.as_tool_message()),
    };

    args.insert(
        "conversationId".to_string(),
        Value::String(conversation_id.clone()),
    );
    let (upstream_id, outcome) = upstream
        .call_tool(
            "codex-reply",
            Value::Object(args.clone()),
            timeout,
            Some(cancel),
            |_id| {},
        )
        .await;
    let output = match outcome {
        Ok(value) => value,
        Err(err) => return CallToolResult::error(err.as_tool_message()),
    };

    if state.store.increment_history(&conversation_id).is_none() {
        // Open question (spec §9): unclear whether a well-behaved upstream
        // can ever reach this branch. Treated as opportunistic recovery,
        // not a contractual guarantee.
        if let Ok(Some(record)) = upstream
            .await_session_for_request(upstream_id, SESSION_RECOVERY_WINDOW, Some(cancel))
            .await
        {
            state.store.add(record);
            state.store.increment_history(&conversation_id);
        }
    }

    CallToolResult::structured(json!({
        "conversationId": conversation_id,
        "output": output,
    }))
}

pub async fn info_payload(state: &BridgeState) -> Value {
    let upstream_server_info = match state.peek_upstream().await {
        Some(upstream) => upstream
            .cached_server_info()
            .map(|info| serde_json::to_value(info).unwrap_or(Value::Null)),
        None => None,
    };
    json!({
        "version": BRIDGE_VERSION,
        "binaryPath": state.binary_path().map(|p| p.display().to_string()),
        "stateDir": state.state_dir.display().to_string(),
        "sessionFile": state.store.path().display().to_string(),
        "sessionCount": state.store.count(),
        "upstreamServerInfo": upstream_server_info,
    })
}

pub fn options_payload(state: &BridgeState) -> Value {
    let observed = state.store.list(None, None).data;
    let auth_mode = policy::infer_auth_mode(observed.iter().filter_map(|r| r.model.as_deref()));
    let mut catalogue = policy::model_catalogue(auth_mode, &observed);
    if let Some(extra) = enrich_catalogue_from_schema_cache(&state.state_dir) {
        for model in extra {
            if !catalogue.contains(&model) {
                catalogue.push(model);
            }
        }
    }
    json!({
        "authMode": auth_mode.as_str(),
        "models": catalogue,
        "taskTypes": ["coding", "discussion", "research"],
        "defaults": {"sandbox": "danger-full-access", "reasoningEffort": "xhigh"},
    })
}

/// Best-effort enrichment from `<state>/schema-cache/<version>/
/// codex_app_server_protocol.schemas.json`: looks for any JSON array of
/// strings nested under a key whose name contains "model". Absence or a
/// malformed cache file is not an error — the built-in catalogue is the
/// authority.
fn enrich_catalogue_from_schema_cache(state_dir: &Path) -> Option<Vec<String>> {
    let cache_root = state_dir.join("schema-cache");
    let newest_version = std::fs::read_dir(&cache_root)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_dir())
        .max_by_key(|e| e.file_name())?;
    let schema_path = newest_version
        .path()
        .join("codex_app_server_protocol.schemas.json");
    let contents = std::fs::read_to_string(schema_path).ok()?;
    let value: Value = serde_json::from_str(&contents).ok()?;
    let mut found = Vec::new();
    find_model_enums(&value, false, &mut found);
    if found.is_empty() { None } else { Some(found) }
}

fn find_model_enums(value: &Value, under_model_key: bool, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let key_matches = key.to_lowercase().contains("model");
                if under_model_key && key == "enum" {
                    if let Value::Array(items) = child {
                        for item in items {
                            if let Value::String(s) = item {
                                out.push(s.clone());
                            }
                        }
                    }
                }
                find_model_enums(child, under_model_key || key_matches, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                find_model_enums(item, under_model_key, out);
            }
        }
        _ => {}
    }
}

pub fn sessions_payload(state: &BridgeState, args: &Map<String, Value>) -> Value {
    let limit = args.get("limit").and_then(Value::as_i64);
    if let Some(query) = args.get("query").and_then(Value::as_str) {
        let data = state.store.search(query, limit);
        json!({"data": data.iter().map(SessionRecord::to_payload).collect::<Vec<_>>()})
    } else {
        let cursor = args.get("cursor").and_then(Value::as_str);
        let page = state.store.list(limit, cursor);
        json!({
            "data": page.data.iter().map(SessionRecord::to_payload).collect::<Vec<_>>(),
            "nextCursor": page.next_cursor,
        })
    }
}

pub fn session_lookup(store: &SessionStore, conversation_id: &str) -> Option<Value> {
    store
        .get(conversation_id)
        .map(|record| serde_json::to_value(record.to_payload()).unwrap_or(Value::Null))
}

fn handle_session_lookup(state: &BridgeState, args: &Map<String, Value>) -> CallToolResult {
    let Some(id) = args.get("conversationId").and_then(Value::as_str) else {
        return CallToolResult::error("missing required argument 'conversationId'");
    };
    match session_lookup(&state.store, id) {
        Some(payload) => CallToolResult::structured(payload),
        None => CallToolResult::error(format!("no session found for id '{id}'")),
    }
}

fn handle_name_session(state: &BridgeState, args: &Map<String, Value>) -> CallToolResult {
    let (Some(id), Some(name)) = (
        args.get("conversationId").and_then(Value::as_str),
        args.get("name").and_then(Value::as_str),
    ) else {
        return CallToolResult::error("'conversationId' and 'name' are required");
    };
    match state.store.update_name(id, name.to_string()) {
        Some(record) => CallToolResult::structured(serde_json::to_value(record.to_payload()).unwrap_or(Value::Null)),
        None => CallToolResult::error(format!("no session found for id '{id}'")),
    }
}

fn handle_delete_session(state: &BridgeState, args: &Map<String, Value>) -> CallToolResult {
    let Some(id) = args.get("conversationId").and_then(Value::as_str) else {
        return CallToolResult::error("missing required argument 'conversationId'");
    };
    let delete_rollout = args
        .get("deleteRollout")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let rollout_path = state.store.get(id).and_then(|r| r.rollout_path);

    let deleted = state.store.delete(id);
    if deleted && delete_rollout {
        if let Some(path) = rollout_path {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!("failed to delete rollout file {path}: {err}");
            }
        }
    }
    CallToolResult::structured(json!({"deleted": deleted}))
}

fn handle_read_rollout(state: &BridgeState, args: &Map<String, Value>) -> CallToolResult {
    let Some(id) = args.get("conversationId").and_then(Value::as_str) else {
        return CallToolResult::error("missing required argument 'conversationId'");
    };
    let Some(record) = state.store.get(id) else {
        return CallToolResult::error(format!("no session found for id '{id}'"));
    };
    let Some(rollout_path) = record.rollout_path else {
        return CallToolResult::error("session has no known rollout path");
    };
    let lines = args
        .get("lines")
        .and_then(Value::as_i64)
        .map(|n| n.clamp(READ_ROLLOUT_MIN_LINES, READ_ROLLOUT_MAX_LINES))
        .unwrap_or(READ_ROLLOUT_DEFAULT_LINES) as usize;

    match std::fs::read_to_string(&rollout_path) {
        Ok(contents) => {
            let all_lines: Vec<&str> = contents.lines().collect();
            let tail = if all_lines.len() > lines {
                &all_lines[all_lines.len() - lines..]
            } else {
                &all_lines[..]
            };
            CallToolResult::text(tail.join("\n"))
        }
        Err(err) => CallToolResult::error(format!("failed to read rollout file: {err}")),
    }
}

fn handle_export_session(state: &BridgeState, args: &Map<String, Value>) -> CallToolResult {
    let Some(id) = args.get("conversationId").and_then(Value::as_str) else {
        return CallToolResult::error("missing required argument 'conversationId'");
    };
    let Some(record) = state.store.get(id) else {
        return CallToolResult::error(format!("no session found for id '{id}'"));
    };
    let Some(rollout_path) = record.rollout_path else {
        return CallToolResult::error("session has no known rollout path");
    };
    let format = args
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("markdown");

    let contents = match std::fs::read_to_string(&rollout_path) {
        Ok(contents) => contents,
        Err(err) => return CallToolResult::error(format!("failed to read rollout file: {err}")),
    };
    let messages = project_rollout_messages(&contents);

    match format {
        "json" => CallToolResult::structured(json!({"conversationId": id, "messages": messages})),
        _ => {
            let mut markdown = String::new();
            for message in &messages {
                let role = message["role"].as_str().unwrap_or("unknown");
                let text = message["text"].as_str().unwrap_or("");
                markdown.push_str(&format!("**{role}:**\n\n{text}\n\n"));
            }
            CallToolResult::text(markdown)
        }
    }
}

/// Tolerant JSONL projection: skips any line that isn't a JSON object with
/// a recognizable `role`/text-bearing shape rather than aborting the
/// export, per the boundary rule that malformed rollout lines are skipped.
fn project_rollout_messages(contents: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let role = value
            .get("role")
            .or_else(|| value.get("msg").and_then(|m| m.get("role")))
            .and_then(Value::as_str);
        let text = extract_text(&value);
        if let (Some(role), Some(text)) = (role, text) {
            messages.push(json!({"role": role, "text": text}));
        }
    }
    messages
}

fn extract_text(value: &Value) -> Option<String> {
    if let Some(text) = value.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(content) = value.get("content").and_then(Value::as_array) {
        let joined: String = content
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    None
}
