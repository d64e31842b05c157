use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use assert_cmd::prelude::*;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::RequestId;
use pretty_assertions::assert_eq;
use std::process::Command as StdCommand;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;

/// Drives the built `codex-bridge-mcp` binary as a downstream client would:
/// spawns it with an isolated state dir and, unless the test wants to
/// exercise the no-upstream-discovered path, points `CODEX_BINARY` at the
/// `stub-codex-mcp` fixture so upstream-backed tools have something to
/// talk to.
pub struct BridgeProcess {
    next_request_id: AtomicI64,
    #[allow(dead_code)]
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BridgeProcess {
    pub async fn spawn(state_dir: &Path, stub_codex_binary: Option<&Path>) -> anyhow::Result<Self> {
        let std_cmd = StdCommand::cargo_bin("codex-bridge-mcp")
            .context("should find binary for codex-bridge-mcp")?;
        let program = std_cmd.get_program().to_owned();

        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.env("CODEX_BRIDGE_STATE_DIR", state_dir);
        cmd.env("RUST_LOG", "info");
        if let Some(binary) = stub_codex_binary {
            cmd.env("CODEX_BINARY", binary);
        } else {
            cmd.env_remove("CODEX_BINARY").env_remove("CODEX_BIN");
        }

        let mut process = cmd
            .kill_on_drop(true)
            .spawn()
            .context("codex-bridge-mcp proc should start")?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| anyhow::format_err!("bridge should have stdin fd"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| anyhow::format_err!("bridge should have stdout fd"))?;

        Ok(Self {
            next_request_id: AtomicI64::new(0),
            process,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    pub fn cargo_bin(name: &str) -> anyhow::Result<std::path::PathBuf> {
        let cmd = StdCommand::cargo_bin(name).with_context(|| format!("should find {name}"))?;
        Ok(cmd.get_program().into())
    }

    /// Performs the initialize handshake, asserting the bridge echoes the
    /// client's protocol version verbatim and names itself "codex-bridge".
    pub async fn initialize(&mut self, protocol_version: &str) -> anyhow::Result<()> {
        let id = self
            .send_request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": protocol_version,
                    "capabilities": {},
                    "clientInfo": {"name": "bridge-test-harness", "version": "0.0.0"},
                })),
            )
            .await?;

        let response = self.read_stream_until_response_message(RequestId::Integer(id)).await?;
        assert_eq!(response.result["protocolVersion"], protocol_version);
        assert_eq!(response.result["serverInfo"]["name"], "codex-bridge");

        self.send_notification("notifications/initialized", None).await?;
        Ok(())
    }

    pub async fn send_request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> anyhow::Result<i64> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let message = JSONRPCMessage::Request(JSONRPCRequest::new(
            RequestId::Integer(request_id),
            method,
            params,
        ));
        self.send_jsonrpc_message(&message).await?;
        Ok(request_id)
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<i64> {
        self.send_request(
            "tools/call",
            Some(serde_json::json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    pub async fn send_notification(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> anyhow::Result<()> {
        let message = JSONRPCMessage::Notification(JSONRPCNotification::new(method, params));
        self.send_jsonrpc_message(&message).await
    }

    /// Writes a raw line verbatim, bypassing message construction — used to
    /// feed malformed frames at the transport boundary.
    pub async fn send_raw_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn send_jsonrpc_message(&mut self, message: &JSONRPCMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(message)?;
        self.send_raw_line(&payload).await
    }

    pub async fn read_jsonrpc_message(&mut self) -> anyhow::Result<JSONRPCMessage> {
        let mut line = String::new();
        self.stdout.read_line(&mut line).await?;
        anyhow::ensure!(!line.is_empty(), "bridge closed stdout before replying");
        Ok(serde_json::from_str::<JSONRPCMessage>(&line)?)
    }

    pub async fn read_jsonrpc_message_timeout(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<JSONRPCMessage> {
        tokio::time::timeout(timeout, self.read_jsonrpc_message())
            .await
            .context("timed out waiting for a bridge reply")?
    }

    pub async fn read_stream_until_response_message(
        &mut self,
        request_id: RequestId,
    ) -> anyhow::Result<JSONRPCResponse> {
        loop {
            match self.read_jsonrpc_message().await? {
                JSONRPCMessage::Response(response) if response.id == request_id => {
                    return Ok(response);
                }
                JSONRPCMessage::Response(_) | JSONRPCMessage::Notification(_) => continue,
                other => anyhow::bail!("unexpected message while awaiting response: {other:?}"),
            }
        }
    }

    pub async fn read_stream_until_error_message(&mut self) -> anyhow::Result<mcp_types::JSONRPCError> {
        loop {
            match self.read_jsonrpc_message().await? {
                JSONRPCMessage::Error(err) => return Ok(err),
                JSONRPCMessage::Notification(_) => continue,
                other => anyhow::bail!("unexpected message while awaiting error: {other:?}"),
            }
        }
    }
}
