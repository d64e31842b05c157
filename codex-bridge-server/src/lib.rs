//! Bridge server entry point (C7): a line-oriented stdin pump feeding the
//! dispatcher (C6), and a single mutex-guarded stdout sink shared with
//! every async tool-call worker.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod codec;
mod resources;
mod server;
mod state;
mod tools;
mod workers;

use codec::DecodedLine;
use codec::FrameWriter;
use codex_bridge_core::SessionStore;
use mcp_types::JSONRPCMessage;
use state::BridgeState;
use std::io::Result as IoResult;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

const STATE_DIR_ENV: &str = "CODEX_BRIDGE_STATE_DIR";
const DEFAULT_STATE_DIR_NAME: &str = ".codex-bridge-mcp";

pub async fn run_main() -> IoResult<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let state_dir = resolve_state_dir();
    let binary_path = codex_upstream_client::discover_binary();
    if binary_path.is_none() {
        tracing::warn!("no codex binary discovered; upstream-backed tools will fail until one is found");
    }

    let store = SessionStore::open(&state_dir)?;
    let state = Arc::new(BridgeState::new(state_dir, binary_path, store));

    let stdin = tokio::io::stdin();
    let writer = FrameWriter::new(tokio::io::stdout());
    let mut lines = BufReader::new(stdin).lines();

    loop {
        if state.should_exit() {
            break;
        }

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };

        match codec::decode_line(&line) {
            DecodedLine::Blank => continue,
            DecodedLine::Error(err) => {
                if let Err(write_err) = writer.write_message(&JSONRPCMessage::Error(err)).await {
                    tracing::error!("failed to write parse-error reply: {write_err}");
                }
            }
            DecodedLine::Message(message) => {
                match server::handle(state.clone(), writer.clone(), message).await {
                    server::Dispatch::Reply(reply) => {
                        if let Err(write_err) = writer.write_message(&reply).await {
                            tracing::error!("failed to write reply: {write_err}");
                        }
                    }
                    server::Dispatch::NoReply => {}
                }
            }
        }
    }

    tracing::info!("entry loop exited");
    Ok(())
}

fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_STATE_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dir_env_override_wins_over_default() {
        // SAFETY: test-local env mutation, not shared with other test
        // binaries since each integration test runs in its own process.
        unsafe {
            std::env::set_var(STATE_DIR_ENV, "/tmp/custom-bridge-state");
        }
        assert_eq!(resolve_state_dir(), PathBuf::from("/tmp/custom-bridge-state"));
        unsafe {
            std::env::remove_var(STATE_DIR_ENV);
        }
    }
}
