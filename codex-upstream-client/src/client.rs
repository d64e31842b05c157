//! Owns the upstream `codex mcp-server` child process: spawns it, pumps its
//! stdio, correlates responses to requests, demuxes `codex/event`
//! notifications into a session-by-upstream-request map, and exposes the
//! three call primitives the bridge server's workers use
//! (`request`, `call_tool`, `await_session_for_request`).

use codex_bridge_core::CancelSignal;
use codex_bridge_core::session::SessionRecord;
use mcp_types::Implementation;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::RequestId;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::sync::oneshot;

use crate::env::build_child_env;

pub use codex_bridge_core::BridgeError as UpstreamError;

/// Responses/event correlation poll on a short sub-timeout so that
/// cancellation and child death are observed promptly, per the gateway's
/// suspension-point design.
const POLL_WINDOW: Duration = Duration::from_millis(250);

/// A bounded cache; once it overflows we drop the whole thing rather than
/// evict individually — a stale session-by-request entry is never useful
/// once the call that would have consumed it has moved on.
const SESSION_MAP_CAPACITY: usize = 2048;

const METHOD_CANCEL: &str = "$/cancelRequest";
const METHOD_CODEX_EVENT: &str = "codex/event";
const SESSION_CONFIGURED: &str = "session_configured";

#[derive(Debug)]
struct PendingState {
    by_id: HashMap<i64, oneshot::Sender<Result<Value, UpstreamError>>>,
}

#[derive(Debug)]
struct SessionByRequestState {
    by_upstream_id: HashMap<i64, SessionRecord>,
}

#[derive(Debug)]
pub struct UpstreamClient {
    stdin: tokio::sync::Mutex<ChildStdin>,
    next_id: AtomicI64,
    pending: Arc<Mutex<PendingState>>,
    sessions: Arc<Mutex<SessionByRequestState>>,
    session_notify: Arc<Notify>,
    exited_flag: Arc<std::sync::atomic::AtomicBool>,
    server_info: Mutex<Option<Implementation>>,
}

impl UpstreamClient {
    pub async fn spawn(
        binary: &PathBuf,
        extra_env: Option<&HashMap<String, String>>,
        cwd: Option<&PathBuf>,
    ) -> Result<Self, UpstreamError> {
        let mut command = Command::new(binary);
        command
            .arg("mcp-server")
            .env_clear()
            .envs(build_child_env(extra_env))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or(UpstreamError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(UpstreamError::ChannelClosed)?;
        let stderr = child.stderr.take().ok_or(UpstreamError::ChannelClosed)?;

        let pending = Arc::new(Mutex::new(PendingState {
            by_id: HashMap::new(),
        }));
        let sessions = Arc::new(Mutex::new(SessionByRequestState {
            by_upstream_id: HashMap::new(),
        }));
        let session_notify = Arc::new(Notify::new());
        let exited_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        tokio::spawn(read_stdout_loop(
            stdout,
            pending.clone(),
            sessions.clone(),
            session_notify.clone(),
        ));
        tokio::spawn(tee_stderr_loop(stderr));
        tokio::spawn(watch_for_exit(
            child,
            pending.clone(),
            session_notify.clone(),
            exited_flag.clone(),
        ));

        let client = Self {
            stdin: tokio::sync::Mutex::new(stdin),
            next_id: AtomicI64::new(1),
            pending,
            sessions,
            session_notify,
            exited_flag,
            server_info: Mutex::new(None),
        };

        Ok(client)
    }

    /// Sends `initialize` and caches the upstream's server info. The
    /// `notifications/initialized` follow-up is deliberately never sent —
    /// the upstream `codex mcp-server` does not implement it.
    pub async fn initialize(&self) -> Result<Implementation, UpstreamError> {
        let params = serde_json::json!({
            "protocolVersion": mcp_types::MCP_SCHEMA_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "codex-bridge-mcp", "version": env!("CARGO_PKG_VERSION")},
        });
        let result = self
            .request("initialize", Some(params), Duration::from_secs(20), None)
            .await?;
        let server_info: Implementation = result
            .get("serverInfo")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        *lock(&self.server_info) = Some(server_info.clone());
        Ok(server_info)
    }

    pub fn cached_server_info(&self) -> Option<Implementation> {
        lock(&self.server_info).clone()
    }

    /// Sends `method` with `params`, waits up to `timeout` for a matching
    /// response. Waiting polls in `POLL_WINDOW` slices so `cancel` and
    /// child-exit are observed promptly rather than after the full timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancelSignal>,
    ) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).by_id.insert(id, tx);

        let request = JSONRPCRequest::new(RequestId::Integer(id), method, params);
        if let Err(err) = self.send(JSONRPCMessage::Request(request)).await {
            lock(&self.pending).by_id.remove(&id);
            return Err(err);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    lock(&self.pending).by_id.remove(&id);
                    self.best_effort_cancel_upstream(id).await;
                    return Err(UpstreamError::Cancelled);
                }
            }
            if self.exited_flag.load(Ordering::SeqCst) {
                lock(&self.pending).by_id.remove(&id);
                return Err(UpstreamError::ProcessExited);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                lock(&self.pending).by_id.remove(&id);
                return Err(UpstreamError::Timeout(timeout));
            }
            let slice = remaining.min(POLL_WINDOW);

            match tokio::time::timeout(slice, &mut rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return Err(UpstreamError::ChannelClosed),
                Err(_) => continue,
            }
        }
    }

    /// Wraps `tools/call`, returning the upstream request id alongside the
    /// result so the caller can later join the session-configured event.
    /// `on_request_id` fires as soon as the id is known — before the reply
    /// arrives — so the caller can record it on its own in-flight entry in
    /// time for a concurrent cancel to find it.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
        cancel: Option<&CancelSignal>,
        on_request_id: impl FnOnce(i64),
    ) -> (i64, Result<Value, UpstreamError>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).by_id.insert(id, tx);

        let params = serde_json::json!({"name": name, "arguments": arguments});
        let request = JSONRPCRequest::new(RequestId::Integer(id), "tools/call", Some(params));
        if let Err(err) = self.send(JSONRPCMessage::Request(request)).await {
            lock(&self.pending).by_id.remove(&id);
            return (id, Err(err));
        }
        on_request_id(id);

        let deadline = tokio::time::Instant::now() + timeout;
        let outcome = loop {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    lock(&self.pending).by_id.remove(&id);
                    self.best_effort_cancel_upstream(id).await;
                    break Err(UpstreamError::Cancelled);
                }
            }
            if self.exited_flag.load(Ordering::SeqCst) {
                lock(&self.pending).by_id.remove(&id);
                break Err(UpstreamError::ProcessExited);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                lock(&self.pending).by_id.remove(&id);
                break Err(UpstreamError::Timeout(timeout));
            }
            let slice = remaining.min(POLL_WINDOW);

            match tokio::time::timeout(slice, &mut rx).await {
                Ok(Ok(outcome)) => break outcome,
                Ok(Err(_)) => break Err(UpstreamError::ChannelClosed),
                Err(_) => continue,
            }
        };
        (id, outcome)
    }

    /// Polls the session-by-upstream-request map for `upstream_id`. Returns
    /// `Ok(None)` on timeout (not an error — the caller treats the session
    /// as unjoined, not the call as failed).
    pub async fn await_session_for_request(
        &self,
        upstream_id: i64,
        timeout: Duration,
        cancel: Option<&CancelSignal>,
    ) -> Result<Option<SessionRecord>, UpstreamError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = lock(&self.sessions).by_upstream_id.remove(&upstream_id) {
                return Ok(Some(record));
            }
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(UpstreamError::Cancelled);
                }
            }
            if self.exited_flag.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let slice = remaining.min(POLL_WINDOW);
            let _ = tokio::time::timeout(slice, self.session_notify.notified()).await;
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.exited_flag.load(Ordering::SeqCst)
    }

    async fn best_effort_cancel_upstream(&self, id: i64) {
        let notification = JSONRPCNotification::new(
            METHOD_CANCEL,
            Some(serde_json::json!({"id": id})),
        );
        let _ = self.send(JSONRPCMessage::Notification(notification)).await;
    }

    async fn send(&self, message: JSONRPCMessage) -> Result<(), UpstreamError> {
        let line = serde_json::to_string(&message)?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

async fn read_stdout_loop(
    stdout: tokio::process::ChildStdout,
    pending: Arc<Mutex<PendingState>>,
    sessions: Arc<Mutex<SessionByRequestState>>,
    session_notify: Arc<Notify>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                handle_upstream_line(&line, &pending, &sessions, &session_notify);
            }
            Ok(None) => {
                tracing::info!("upstream stdout closed");
                break;
            }
            Err(err) => {
                tracing::error!("error reading upstream stdout: {err}");
                break;
            }
        }
    }
}

fn handle_upstream_line(
    line: &str,
    pending: &Arc<Mutex<PendingState>>,
    sessions: &Arc<Mutex<SessionByRequestState>>,
    session_notify: &Arc<Notify>,
) {
    let message: JSONRPCMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!("failed to parse upstream line: {err}");
            return;
        }
    };

    match message {
        JSONRPCMessage::Response(response) => {
            deliver(pending, &response.id, Ok(response.result));
        }
        JSONRPCMessage::Error(error) => {
            deliver(
                pending,
                &error.id,
                Err(UpstreamError::Upstream(error.error.message)),
            );
        }
        JSONRPCMessage::Notification(notification) => {
            if notification.method == METHOD_CODEX_EVENT {
                handle_codex_event(notification.params, sessions, session_notify);
            } else {
                tracing::debug!("upstream notification: {}", notification.method);
            }
        }
        JSONRPCMessage::Request(request) => {
            tracing::debug!("upstream server-initiated request: {}", request.method);
        }
    }
}

fn deliver(
    pending: &Arc<Mutex<PendingState>>,
    id: &RequestId,
    outcome: Result<Value, UpstreamError>,
) {
    let RequestId::Integer(id) = id else {
        tracing::warn!("dropping orphan response with non-integer id");
        return;
    };
    let sender = lock(pending).by_id.remove(id);
    match sender {
        Some(sender) => {
            let _ = sender.send(outcome);
        }
        None => {
            tracing::debug!("dropping orphan response for id {id}");
        }
    }
}

fn handle_codex_event(
    params: Option<Value>,
    sessions: &Arc<Mutex<SessionByRequestState>>,
    session_notify: &Arc<Notify>,
) {
    let Some(params) = params else { return };
    let event_type = params
        .get("msg")
        .and_then(|m| m.get("type"))
        .or_else(|| params.get("type"))
        .and_then(|t| t.as_str());
    if event_type != Some(SESSION_CONFIGURED) {
        return;
    }
    let session_id = params
        .get("msg")
        .and_then(|m| m.get("session_id"))
        .or_else(|| params.get("session_id"))
        .and_then(|v| v.as_str());
    let upstream_request_id = params
        .get("_meta")
        .and_then(|m| m.get("requestId"))
        .and_then(|v| v.as_i64());

    let (Some(session_id), Some(upstream_request_id)) = (session_id, upstream_request_id) else {
        return;
    };

    let msg = params.get("msg");
    let str_field = |key: &str| -> Option<String> {
        msg.and_then(|m| m.get(key)).and_then(Value::as_str).map(str::to_string)
    };
    let i64_field = |key: &str| -> Option<i64> {
        msg.and_then(|m| m.get(key)).and_then(Value::as_i64)
    };

    let mut record = SessionRecord::new(session_id.to_string(), now_seconds());
    record.model = str_field("model");
    record.model_provider_id = str_field("model_provider_id");
    record.approval_policy = str_field("approval_policy");
    record.cwd = str_field("cwd");
    record.reasoning_effort = str_field("reasoning_effort");
    record.rollout_path = str_field("rollout_path");
    record.sandbox_policy = msg
        .and_then(|m| m.get("sandbox_policy"))
        .filter(|v| v.is_object())
        .cloned();
    record.history_log_id = i64_field("history_log_id");
    record.history_entry_count = i64_field("history_entry_count");

    let mut guard = lock(sessions);
    if guard.by_upstream_id.len() >= SESSION_MAP_CAPACITY {
        guard.by_upstream_id.clear();
    }
    guard.by_upstream_id.insert(upstream_request_id, record);
    drop(guard);
    session_notify.notify_waiters();
}

/// Waits for the child to exit, then fails every still-pending request so
/// no waiter blocks forever on a process that is no longer there.
async fn watch_for_exit(
    mut child: Child,
    pending: Arc<Mutex<PendingState>>,
    session_notify: Arc<Notify>,
    exited_flag: Arc<std::sync::atomic::AtomicBool>,
) {
    let status = child.wait().await;
    tracing::warn!("upstream process exited: {status:?}");
    exited_flag.store(true, Ordering::SeqCst);

    let stale: Vec<_> = lock(&pending).by_id.drain().collect();
    for (_, sender) in stale {
        let _ = sender.send(Err(UpstreamError::ProcessExited));
    }
    session_notify.notify_waiters();
}

async fn tee_stderr_loop(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!("[codex] {line}");
    }
}

fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sessions_state() -> (Arc<Mutex<SessionByRequestState>>, Arc<Notify>) {
        (
            Arc::new(Mutex::new(SessionByRequestState {
                by_upstream_id: HashMap::new(),
            })),
            Arc::new(Notify::new()),
        )
    }

    #[test]
    fn session_configured_event_populates_every_session_record_field() {
        let (sessions, notify) = sessions_state();
        let params = json!({
            "_meta": {"requestId": 7},
            "msg": {
                "type": "session_configured",
                "session_id": "event-conv-456",
                "model": "gpt-5.2",
                "model_provider_id": "openai",
                "approval_policy": "never",
                "sandbox_policy": {"type": "workspace-write"},
                "cwd": "/tmp/test",
                "reasoning_effort": "medium",
                "rollout_path": "/tmp/rollout.jsonl",
                "history_log_id": 1,
                "history_entry_count": 0,
            },
        });

        handle_codex_event(Some(params), &sessions, &notify);

        let record = lock(&sessions)
            .by_upstream_id
            .get(&7)
            .cloned()
            .expect("session recorded under its upstream request id");
        assert_eq!(record.conversation_id, "event-conv-456");
        assert_eq!(record.model.as_deref(), Some("gpt-5.2"));
        assert_eq!(record.model_provider_id.as_deref(), Some("openai"));
        assert_eq!(record.approval_policy.as_deref(), Some("never"));
        assert_eq!(record.sandbox_policy, Some(json!({"type": "workspace-write"})));
        assert_eq!(record.cwd.as_deref(), Some("/tmp/test"));
        assert_eq!(record.reasoning_effort.as_deref(), Some("medium"));
        assert_eq!(record.rollout_path.as_deref(), Some("/tmp/rollout.jsonl"));
        assert_eq!(record.history_log_id, Some(1));
        assert_eq!(record.history_entry_count, Some(0));
    }

    #[test]
    fn malformed_optional_fields_are_ignored_not_fatal() {
        let (sessions, notify) = sessions_state();
        let params = json!({
            "_meta": {"requestId": 1},
            "msg": {
                "type": "session_configured",
                "session_id": "minimal-123",
                "model": 12345,
                "sandbox_policy": "should-be-object",
                "history_log_id": "not-an-int",
            },
        });

        handle_codex_event(Some(params), &sessions, &notify);

        let record = lock(&sessions)
            .by_upstream_id
            .get(&1)
            .cloned()
            .expect("session recorded despite malformed optional fields");
        assert_eq!(record.conversation_id, "minimal-123");
        assert_eq!(record.model, None);
        assert_eq!(record.sandbox_policy, None);
        assert_eq!(record.history_log_id, None);
    }
}
