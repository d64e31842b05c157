//! A minimal stand-in for `codex mcp-server` used only by this workspace's
//! end-to-end tests. Speaks just enough JSON-RPC-over-stdio to let the
//! bridge's upstream-facing code (spawn, initialize, tools/call,
//! session-configured join) exercise its real paths without depending on
//! the actual `codex` CLI, which is out of scope to bundle here.
//!
//! Understands three request methods (`initialize`, `tools/call`,
//! `shutdown`) and ignores everything else, including the one notification
//! the bridge may send it (`$/cancelRequest`) — cancellation is observed
//! bridge-side by polling, so this stub doesn't need to cooperate with it.

use serde_json::Value;
use serde_json::json;
use std::io::BufRead;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

static STDOUT: Mutex<()> = Mutex::new(());

/// `arguments.prompt` value that makes a `codex` tools/call never reply,
/// simulating a stuck upstream so tests can exercise cancellation.
const HANG_PROMPT: &str = "__hang__";

fn main() {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        handle_message(&value);
    }
}

fn handle_message(message: &Value) {
    let method = message.get("method").and_then(Value::as_str).unwrap_or("");
    let id = message.get("id").cloned();

    match (method, id) {
        ("initialize", Some(id)) => {
            let protocol_version = message
                .get("params")
                .and_then(|p| p.get("protocolVersion"))
                .cloned()
                .unwrap_or_else(|| json!("2025-11-25"));
            respond(
                id,
                json!({
                    "protocolVersion": protocol_version,
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {"name": "stub-codex", "version": "0.0.0"},
                }),
            );
        }
        ("tools/call", Some(id)) => handle_tool_call(message, id),
        ("shutdown", Some(id)) => respond(id, Value::Null),
        // Unsolicited downstream-style notifications (no `id`), including
        // `$/cancelRequest`: nothing for this stub to do.
        (_, None) => {}
        (other, Some(id)) => respond_error(id, format!("stub does not implement {other}")),
    }
}

fn handle_tool_call(message: &Value, id: Value) {
    let params = message.get("params");
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let arguments = params.and_then(|p| p.get("arguments"));
    let prompt = arguments
        .and_then(|a| a.get("prompt"))
        .and_then(Value::as_str)
        .unwrap_or("");

    if name == "codex" {
        let request_id = id.as_i64().unwrap_or_default();
        emit_session_configured(request_id, arguments);
        if prompt == HANG_PROMPT {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    respond(
        id,
        json!({
            "content": [{"type": "text", "text": format!("stub handled {name}")}],
            "isError": false,
        }),
    );
}

fn emit_session_configured(upstream_request_id: i64, arguments: Option<&Value>) {
    let model = arguments
        .and_then(|a| a.get("model"))
        .and_then(Value::as_str)
        .unwrap_or("stub-model");
    write_line(&json!({
        "jsonrpc": "2.0",
        "method": "codex/event",
        "params": {
            "_meta": {"requestId": upstream_request_id},
            "msg": {
                "type": "session_configured",
                "session_id": format!("stub-session-{upstream_request_id}"),
                "model": model,
            },
        },
    }));
}

fn respond(id: Value, result: Value) {
    write_line(&json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn respond_error(id: Value, message: String) {
    write_line(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": -32601, "message": message},
    }));
}

fn write_line(value: &Value) {
    let Ok(encoded) = serde_json::to_string(value) else {
        return;
    };
    let guard = STDOUT.lock();
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{encoded}");
    let _ = stdout.flush();
    drop(guard);
}
