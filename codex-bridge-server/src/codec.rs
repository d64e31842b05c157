//! Reads newline-delimited JSON-RPC records and classifies parse failures
//! before anything downstream sees them. Writing goes through a single
//! mutex-guarded `AsyncWrite` so concurrent writers can never interleave a
//! partial frame.

use mcp_types::INVALID_REQUEST;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCRequest;
use mcp_types::PARSE_ERROR;
use mcp_types::RequestId;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub enum DecodedLine {
    /// Empty or whitespace-only; skip without a reply.
    Blank,
    /// Well-formed JSON-RPC envelope.
    Message(JSONRPCMessage),
    /// Valid JSON but not an object, or not valid JSON at all.
    Error(JSONRPCError),
}

pub fn decode_line(line: &str) -> DecodedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return DecodedLine::Blank;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            return DecodedLine::Error(JSONRPCError::new(
                RequestId::Null(()),
                PARSE_ERROR,
                format!("invalid JSON: {err}"),
            ));
        }
    };

    if !value.is_object() {
        return DecodedLine::Error(JSONRPCError::new(
            RequestId::Null(()),
            INVALID_REQUEST,
            "frame is valid JSON but not an object",
        ));
    }

    match serde_json::from_value::<JSONRPCMessage>(value.clone()) {
        Ok(message) => DecodedLine::Message(message),
        Err(err) => recover_as_request(&value).unwrap_or_else(|| {
            DecodedLine::Error(JSONRPCError::new(
                RequestId::Null(()),
                INVALID_REQUEST,
                format!("frame is not a recognizable JSON-RPC message: {err}"),
            ))
        }),
    }
}

/// A request-shaped object (has both `id` and `method`) that fails the
/// typed parse for some other reason — an unrecognized `params` shape, a
/// missing `jsonrpc` field — still carries enough to route through normal
/// request dispatch, preserving the caller's id so method-not-found or a
/// tool-level param error can be reported instead of a transport error.
fn recover_as_request(value: &serde_json::Value) -> Option<DecodedLine> {
    let id: RequestId = serde_json::from_value(value.get("id")?.clone()).ok()?;
    let method = value.get("method")?.as_str()?.to_string();
    let params = value.get("params").cloned();
    Some(DecodedLine::Message(JSONRPCMessage::Request(
        JSONRPCRequest::new(id, method, params),
    )))
}

pub fn encode_message(message: &JSONRPCMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// A single-writer-at-a-time sink shared by the entry loop and every worker
/// task that replies asynchronously. Cloning shares the same underlying
/// writer — `#[derive(Clone)]` would wrongly require `W: Clone`, which
/// `tokio::io::Stdout` does not implement, even though only the `Arc` is
/// actually being cloned.
pub struct FrameWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn write_message(&self, message: &JSONRPCMessage) -> std::io::Result<()> {
        let line = encode_message(message)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let mut writer = self.inner.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}
