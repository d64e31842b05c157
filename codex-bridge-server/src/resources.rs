//! The three fixed resource URIs plus the session-by-id template. All
//! bodies are JSON text, reusing the same payload builders the
//! corresponding `codex-bridge-*` tools expose.

use crate::state::BridgeState;
use crate::workers;
use codex_bridge_core::BridgeError;
use mcp_types::ListResourceTemplatesResult;
use mcp_types::ListResourcesResult;
use mcp_types::ReadResourceResult;
use mcp_types::Resource;
use mcp_types::ResourceTemplate;
use mcp_types::TextResourceContents;

const URI_INFO: &str = "codex-bridge://info";
const URI_OPTIONS: &str = "codex-bridge://options";
const URI_SESSIONS: &str = "codex-bridge://sessions";
const SESSION_URI_PREFIX: &str = "codex-bridge://session/";
const SESSION_URI_TEMPLATE: &str = "codex-bridge://session/{conversationId}";

pub fn list_resources() -> ListResourcesResult {
    ListResourcesResult {
        resources: vec![
            Resource {
                uri: URI_INFO.to_string(),
                name: "Bridge info".to_string(),
                description: Some("Version, binary path, state directory, session count.".to_string()),
                mime_type: Some("application/json".to_string()),
            },
            Resource {
                uri: URI_OPTIONS.to_string(),
                name: "Bridge options".to_string(),
                description: Some("Model catalogue, auth mode, and policy defaults.".to_string()),
                mime_type: Some("application/json".to_string()),
            },
            Resource {
                uri: URI_SESSIONS.to_string(),
                name: "Sessions".to_string(),
                description: Some("All known sessions, most recent first.".to_string()),
                mime_type: Some("application/json".to_string()),
            },
        ],
    }
}

pub fn list_resource_templates() -> ListResourceTemplatesResult {
    ListResourceTemplatesResult {
        resource_templates: vec![ResourceTemplate {
            uri_template: SESSION_URI_TEMPLATE.to_string(),
            name: "Session by id".to_string(),
            description: Some("A single session record by conversation id.".to_string()),
        }],
    }
}

pub async fn read_resource(state: &BridgeState, uri: &str) -> Result<ReadResourceResult, BridgeError> {
    let body = match uri {
        URI_INFO => workers::info_payload(state).await,
        URI_OPTIONS => workers::options_payload(state),
        URI_SESSIONS => workers::sessions_payload(state, &serde_json::Map::new()),
        other => {
            let Some(id) = other.strip_prefix(SESSION_URI_PREFIX) else {
                return Err(BridgeError::Param(format!("unknown resource uri: {other}")));
            };
            workers::session_lookup(&state.store, id)
                .ok_or_else(|| BridgeError::Param(format!("no session found for id '{id}'")))?
        }
    };

    Ok(ReadResourceResult {
        contents: vec![TextResourceContents {
            uri: uri.to_string(),
            mime_type: Some("application/json".to_string()),
            text: serde_json::to_string(&body)?,
        }],
    })
}
