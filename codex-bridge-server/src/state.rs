//! Shared state the dispatcher and every tool worker reach into: the
//! session index, the lazily-spawned upstream client, the in-flight call
//! registry cancellation hangs off, and the cached composed tool list.

use codex_bridge_core::BridgeError;
use codex_bridge_core::SessionStore;
use codex_bridge_core::cancel::CancelSignal;
use codex_upstream_client::UpstreamClient;
use mcp_types::RequestId;
use mcp_types::Tool;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

pub const BRIDGE_NAME: &str = "codex-bridge";
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a tool worker or the dispatcher needs, held behind an `Arc`
/// and cloned into every spawned task.
pub struct BridgeState {
    pub store: Arc<SessionStore>,
    pub state_dir: PathBuf,
    binary_path: Option<PathBuf>,
    upstream: RwLock<Option<Arc<UpstreamClient>>>,
    in_flight: Mutex<HashMap<RequestId, CancelSignal>>,
    cached_tools: RwLock<Option<Vec<Tool>>>,
    exit_requested: AtomicBool,
}

impl BridgeState {
    pub fn new(state_dir: PathBuf, binary_path: Option<PathBuf>, store: SessionStore) -> Self {
        Self {
            store: Arc::new(store),
            state_dir,
            binary_path,
            upstream: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
            cached_tools: RwLock::new(None),
            exit_requested: AtomicBool::new(false),
        }
    }

    pub fn binary_path(&self) -> Option<&Path> {
        self.binary_path.as_deref()
    }

    /// Returns the current upstream client without spawning one — used by
    /// read-only surfaces (e.g. `codex-bridge-info`) that should report
    /// "not yet started" rather than force a spawn just to answer a query.
    pub async fn peek_upstream(&self) -> Option<Arc<UpstreamClient>> {
        self.upstream.read().await.clone()
    }

    /// Returns the live upstream client, spawning and initializing one if
    /// none exists yet or the previous one's process has exited.
    pub async fn ensure_upstream(&self) -> Result<Arc<UpstreamClient>, BridgeError> {
        {
            let guard = self.upstream.read().await;
            if let Some(client) = guard.as_ref() {
                if client.is_alive() {
                    return Ok(client.clone());
                }
            }
        }

        let binary = self
            .binary_path
            .clone()
            .ok_or_else(|| BridgeError::Protocol("no codex binary could be located".to_string()))?;

        let mut guard = self.upstream.write().await;
        if let Some(client) = guard.as_ref() {
            if client.is_alive() {
                return Ok(client.clone());
            }
        }

        let client = Arc::new(UpstreamClient::spawn(&binary, None, None).await?);
        client.initialize().await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    pub async fn register_in_flight(&self, id: RequestId, cancel: CancelSignal) {
        self.in_flight.lock().await.insert(id, cancel);
    }

    pub async fn take_in_flight(&self, id: &RequestId) -> Option<CancelSignal> {
        self.in_flight.lock().await.remove(id)
    }

    pub async fn is_in_flight(&self, id: &RequestId) -> bool {
        self.in_flight.lock().await.contains_key(id)
    }

    /// Looks up and cancels an in-flight call without removing it — the
    /// worker itself removes its own entry once it observes the signal and
    /// returns a reply, so a `$/cancelRequest` that races the reply never
    /// double-frees the registry slot.
    pub async fn cancel_in_flight(&self, id: &RequestId) -> bool {
        match self.in_flight.lock().await.get(id) {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cached_tools(&self) -> Option<Vec<Tool>> {
        self.cached_tools.read().await.clone()
    }

    pub async fn set_cached_tools(&self, tools: Vec<Tool>) {
        *self.cached_tools.write().await = Some(tools);
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn should_exit(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }
}
