//! The downstream JSON-RPC dispatcher (C6): decides, for every decoded
//! message, whether to reply synchronously, drop it as a notification, or
//! hand it to a spawned worker that will reply later through the shared
//! [`FrameWriter`].

use crate::codec::FrameWriter;
use crate::resources;
use crate::state::BRIDGE_NAME;
use crate::state::BRIDGE_VERSION;
use crate::state::BridgeState;
use crate::tools;
use crate::workers;
use codex_bridge_core::cancel::CancelSignal;
use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::CancelledNotificationParams;
use mcp_types::Implementation;
use mcp_types::INVALID_PARAMS;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListToolsResult;
use mcp_types::METHOD_NOT_FOUND;
use mcp_types::InitializeResult;
use mcp_types::RequestId;
use mcp_types::ServerCapabilities;
use mcp_types::ServerCapabilitiesPrompts;
use mcp_types::ServerCapabilitiesResources;
use mcp_types::ServerCapabilitiesTools;
use mcp_types::Tool;
use serde_json::Value;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Upstream `tools/list` is given this long before the composed list falls
/// back to the static definitions.
const UPSTREAM_TOOLS_LIST_TIMEOUT: Duration = Duration::from_secs(2);

/// What the entry loop should do with a decoded message once dispatch
/// returns.
pub enum Dispatch {
    Reply(JSONRPCMessage),
    NoReply,
}

pub async fn handle<W>(
    state: Arc<BridgeState>,
    writer: FrameWriter<W>,
    message: JSONRPCMessage,
) -> Dispatch
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match message {
        JSONRPCMessage::Request(request) => handle_request(state, writer, request).await,
        JSONRPCMessage::Notification(notification) => {
            handle_notification(&state, notification).await;
            Dispatch::NoReply
        }
        JSONRPCMessage::Response(_) | JSONRPCMessage::Error(_) => {
            tracing::debug!("ignoring unsolicited response/error from downstream peer");
            Dispatch::NoReply
        }
    }
}

async fn handle_request<W>(
    state: Arc<BridgeState>,
    writer: FrameWriter<W>,
    request: JSONRPCRequest,
) -> Dispatch
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => handle_initialize(id, request.params),
        "shutdown" => reply(id, Value::Null),
        "tools/list" => {
            let tools = compose_tools_list(&state).await;
            let result = ListToolsResult {
                tools,
                next_cursor: None,
            };
            reply(id, serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "tools/call" => handle_tools_call(state, writer, id, request.params).await,
        "resources/list" => reply(
            id,
            serde_json::to_value(resources::list_resources()).unwrap_or(Value::Null),
        ),
        "resources/templates/list" => reply(
            id,
            serde_json::to_value(resources::list_resource_templates()).unwrap_or(Value::Null),
        ),
        "resources/read" => handle_resources_read(&state, id, request.params).await,
        "prompts/list" => reply(id, json!({"prompts": []})),
        other => Dispatch::Reply(JSONRPCMessage::Error(JSONRPCError::new(
            id,
            METHOD_NOT_FOUND,
            format!("unknown method: {other}"),
        ))),
    }
}

async fn handle_notification(state: &BridgeState, notification: JSONRPCNotification) {
    match notification.method.as_str() {
        "exit" => state.request_exit(),
        "$/cancelRequest" => {
            let Some(params) = notification.params else {
                return;
            };
            match serde_json::from_value::<CancelledNotificationParams>(params) {
                Ok(parsed) => {
                    state.cancel_in_flight(&parsed.request_id).await;
                }
                Err(err) => tracing::warn!("malformed $/cancelRequest params: {err}"),
            }
        }
        "notifications/initialized" => {}
        other => tracing::debug!("ignoring unknown notification: {other}"),
    }
}

fn handle_initialize(id: RequestId, params: Option<Value>) -> Dispatch {
    let protocol_version = params
        .as_ref()
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| mcp_types::MCP_SCHEMA_VERSION.to_string());

    let result = InitializeResult {
        protocol_version,
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            resources: Some(ServerCapabilitiesResources {
                subscribe: Some(false),
                list_changed: Some(false),
            }),
            prompts: Some(ServerCapabilitiesPrompts {
                list_changed: Some(false),
            }),
        },
        server_info: Implementation {
            name: BRIDGE_NAME.to_string(),
            version: Some(BRIDGE_VERSION.to_string()),
        },
        instructions: None,
    };
    reply(id, serde_json::to_value(result).unwrap_or(Value::Null))
}

async fn handle_resources_read(state: &BridgeState, id: RequestId, params: Option<Value>) -> Dispatch {
    let uri = match params.as_ref().and_then(|p| p.get("uri")).and_then(Value::as_str) {
        Some(uri) => uri.to_string(),
        None => {
            return Dispatch::Reply(JSONRPCMessage::Error(JSONRPCError::new(
                id,
                INVALID_PARAMS,
                "missing 'uri'",
            )));
        }
    };
    match resources::read_resource(state, &uri).await {
        Ok(result) => reply(id, serde_json::to_value(result).unwrap_or(Value::Null)),
        Err(err) => Dispatch::Reply(JSONRPCMessage::Error(JSONRPCError::new(
            id,
            INVALID_PARAMS,
            err.to_string(),
        ))),
    }
}

async fn handle_tools_call<W>(
    state: Arc<BridgeState>,
    writer: FrameWriter<W>,
    id: RequestId,
    params: Option<Value>,
) -> Dispatch
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let parsed: CallToolRequestParams = match params.map(serde_json::from_value) {
        Some(Ok(parsed)) => parsed,
        Some(Err(err)) => return Dispatch::Reply(tool_error_reply(id, format!("invalid params: {err}"))),
        None => return Dispatch::Reply(tool_error_reply(id, "missing 'params'")),
    };

    if state.is_in_flight(&id).await {
        return Dispatch::Reply(tool_error_reply(id, "duplicate in-flight request id"));
    }

    let cancel = CancelSignal::new();
    state.register_in_flight(id.clone(), cancel.clone()).await;

    let task_state = state.clone();
    let task_writer = writer;
    let task_id = id;
    tokio::spawn(async move {
        let result =
            workers::dispatch_tool_call(task_state.clone(), parsed.name, parsed.arguments, cancel)
                .await;
        task_state.take_in_flight(&task_id).await;
        let response = JSONRPCMessage::Response(JSONRPCResponse::new(
            task_id,
            serde_json::to_value(result).unwrap_or(Value::Null),
        ));
        if let Err(err) = task_writer.write_message(&response).await {
            tracing::error!("failed to write tools/call response: {err}");
        }
    });

    Dispatch::NoReply
}

async fn compose_tools_list(state: &BridgeState) -> Vec<Tool> {
    if let Some(cached) = state.cached_tools().await {
        return cached;
    }

    let mut list = match fetch_upstream_tools(state).await {
        Some(tools) => tools,
        None => tools::static_fallback_tools(),
    };
    for tool in list.iter_mut() {
        let extra = match tool.name.as_str() {
            "codex" => Some(tools::codex_extra_schema()),
            "codex-reply" => Some(tools::codex_reply_extra_schema()),
            _ => None,
        };
        if let Some(extra) = extra {
            tools::patch_with_extra_properties(&mut tool.input_schema, &extra);
        }
    }
    list.extend(tools::bridge_only_tools());

    state.set_cached_tools(list.clone()).await;
    list
}

async fn fetch_upstream_tools(state: &BridgeState) -> Option<Vec<Tool>> {
    let upstream = state.ensure_upstream().await.ok()?;
    let result = upstream
        .request("tools/list", None, UPSTREAM_TOOLS_LIST_TIMEOUT, None)
        .await
        .ok()?;
    let parsed: ListToolsResult = serde_json::from_value(result).ok()?;
    Some(parsed.tools)
}

fn reply(id: RequestId, result: Value) -> Dispatch {
    Dispatch::Reply(JSONRPCMessage::Response(JSONRPCResponse::new(id, result)))
}

fn tool_error_reply(id: RequestId, message: impl Into<String>) -> JSONRPCMessage {
    let result = CallToolResult::error(message);
    JSONRPCMessage::Response(JSONRPCResponse::new(
        id,
        serde_json::to_value(result).unwrap_or(Value::Null),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use codex_bridge_core::SessionStore;
    use mcp_types::RequestId as Rid;

    fn state() -> Arc<BridgeState> {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        Arc::new(BridgeState::new(dir.path().to_path_buf(), None, store))
    }

    fn sink() -> FrameWriter<tokio::io::Sink> {
        FrameWriter::new(tokio::io::sink())
    }

    #[tokio::test]
    async fn initialize_echoes_client_protocol_version_and_names_the_server() {
        let request = JSONRPCRequest::new(
            Rid::Integer(1),
            "initialize",
            Some(json!({"protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {"name": "t"}})),
        );
        match handle(state(), sink(), JSONRPCMessage::Request(request)).await {
            Dispatch::Reply(JSONRPCMessage::Response(response)) => {
                assert_eq!(response.result["protocolVersion"], "2024-11-05");
                assert_eq!(response.result["serverInfo"]["name"], "codex-bridge");
            }
            _ => panic!("expected a synchronous reply"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let request = JSONRPCRequest::new(Rid::Integer(2), "foo/bar", None);
        match handle(state(), sink(), JSONRPCMessage::Request(request)).await {
            Dispatch::Reply(JSONRPCMessage::Error(err)) => {
                assert_eq!(err.error.code, METHOD_NOT_FOUND);
            }
            _ => panic!("expected a JSON-RPC error"),
        }
    }

    #[tokio::test]
    async fn tools_call_with_malformed_params_is_a_tool_error_not_a_protocol_error() {
        let request = JSONRPCRequest::new(Rid::Integer(3), "tools/call", None);
        match handle(state(), sink(), JSONRPCMessage::Request(request)).await {
            Dispatch::Reply(JSONRPCMessage::Response(response)) => {
                assert_eq!(response.result["isError"], true);
            }
            _ => panic!("expected a tool-result reply"),
        }
    }

    #[tokio::test]
    async fn tools_call_with_well_formed_params_returns_no_reply_and_spawns_a_worker() {
        let request = JSONRPCRequest::new(
            Rid::Integer(4),
            "tools/call",
            Some(json!({"name": "codex-bridge-info", "arguments": {}})),
        );
        match handle(state(), sink(), JSONRPCMessage::Request(request)).await {
            Dispatch::NoReply => {}
            _ => panic!("expected the worker to own the reply"),
        }
    }
}
