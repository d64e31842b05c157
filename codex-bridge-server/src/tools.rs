//! Tool definitions and schemas advertised over `tools/list`.
//!
//! `codex` and `codex-reply` are forwarded tools: their canonical schema
//! comes from the upstream's own `tools/list`, but this bridge always
//! patches in a handful of bridge-specific extra properties
//! (`timeoutMs`, `startupTimeoutMs`, `reasoningEffort`, `reasoningSummary`,
//! `name`, `taskType`) before advertising them, and falls back to a
//! locally-built schema when the upstream can't be reached in time. The
//! remaining `codex-bridge-*` tools are bridge-only; their schema is
//! authored here directly.

use mcp_types::Tool;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

/// Extra arguments every `codex` call accepts on top of whatever the
/// upstream itself defines, consumed by this bridge before the call is
/// forwarded.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodexBridgeExtraArgs {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default)]
    pub startup_timeout_ms: Option<i64>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub reasoning_summary: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodexReplyExtraArgs {
    pub conversation_id: String,
    pub prompt: String,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
}

fn generate_schema<T: JsonSchema>() -> Value {
    let settings = SchemaSettings::draft2019_09().with(|s| {
        s.inline_subschemas = true;
        s.option_add_null_type = false;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}))
}

/// Merges `extra`'s `properties` into `schema`'s `properties`, leaving
/// everything the upstream already declared (including `required`)
/// untouched — the extra fields are always optional additions.
pub fn patch_with_extra_properties(schema: &mut Value, extra: &Value) {
    let Some(extra_props) = extra.get("properties").and_then(Value::as_object) else {
        return;
    };
    let object = schema.as_object_mut().map(|o| {
        o.entry("properties".to_string())
            .or_insert_with(|| Value::Object(Map::new()))
    });
    if let Some(Value::Object(props)) = object {
        for (key, value) in extra_props {
            props.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

pub fn codex_extra_schema() -> Value {
    generate_schema::<CodexBridgeExtraArgs>()
}

pub fn codex_reply_extra_schema() -> Value {
    generate_schema::<CodexReplyExtraArgs>()
}

/// Used when the upstream's own `tools/list` can't be reached in time.
pub fn static_fallback_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "codex".to_string(),
            description: Some("Start a new Codex conversation.".to_string()),
            input_schema: codex_extra_schema(),
            annotations: None,
        },
        Tool {
            name: "codex-reply".to_string(),
            description: Some("Continue an existing Codex conversation.".to_string()),
            input_schema: codex_reply_extra_schema(),
            annotations: None,
        },
    ]
}

pub fn bridge_only_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "codex-bridge-info".to_string(),
            description: Some(
                "Return bridge version, binary path, state directory, and session count."
                    .to_string(),
            ),
            input_schema: json!({"type": "object", "properties": {}}),
            annotations: None,
        },
        Tool {
            name: "codex-bridge-options".to_string(),
            description: Some(
                "Return model catalogue, auth mode, and policy defaults.".to_string(),
            ),
            input_schema: json!({"type": "object", "properties": {}}),
            annotations: None,
        },
        Tool {
            name: "codex-bridge-sessions".to_string(),
            description: Some("List or search known sessions.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer"},
                    "cursor": {"type": "string"},
                    "query": {"type": "string"},
                },
            }),
            annotations: None,
        },
        Tool {
            name: "codex-bridge-session".to_string(),
            description: Some("Look up one session by conversation id.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"conversationId": {"type": "string"}},
                "required": ["conversationId"],
            }),
            annotations: None,
        },
        Tool {
            name: "codex-bridge-name-session".to_string(),
            description: Some("Assign a human-readable name to a session.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "conversationId": {"type": "string"},
                    "name": {"type": "string"},
                },
                "required": ["conversationId", "name"],
            }),
            annotations: None,
        },
        Tool {
            name: "codex-bridge-delete-session".to_string(),
            description: Some("Delete a session from the index.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "conversationId": {"type": "string"},
                    "deleteRollout": {"type": "boolean"},
                },
                "required": ["conversationId"],
            }),
            annotations: None,
        },
        Tool {
            name: "codex-bridge-read-rollout".to_string(),
            description: Some("Tail the last N lines of a session's rollout file.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "conversationId": {"type": "string"},
                    "lines": {"type": "integer"},
                },
                "required": ["conversationId"],
            }),
            annotations: None,
        },
        Tool {
            name: "codex-bridge-export-session".to_string(),
            description: Some(
                "Export a session's rollout as markdown or JSON.".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "conversationId": {"type": "string"},
                    "format": {"type": "string", "enum": ["markdown", "json"]},
                },
                "required": ["conversationId"],
            }),
            annotations: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_adds_bridge_properties_without_clobbering_existing_ones() {
        let mut upstream_schema = json!({
            "type": "object",
            "properties": {"prompt": {"type": "string"}},
            "required": ["prompt"],
        });
        patch_with_extra_properties(&mut upstream_schema, &codex_extra_schema());

        assert_eq!(upstream_schema["properties"]["prompt"]["type"], "string");
        assert!(upstream_schema["properties"]["timeoutMs"].is_object());
        assert_eq!(upstream_schema["required"], json!(["prompt"]));
    }

    #[test]
    fn bridge_only_tools_cover_every_management_operation() {
        let names: Vec<_> = bridge_only_tools().into_iter().map(|t| t.name).collect();
        for expected in [
            "codex-bridge-info",
            "codex-bridge-options",
            "codex-bridge-sessions",
            "codex-bridge-session",
            "codex-bridge-name-session",
            "codex-bridge-delete-session",
            "codex-bridge-read-rollout",
            "codex-bridge-export-session",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }
}
