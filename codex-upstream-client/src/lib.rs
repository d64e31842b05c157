//! Client side of the bridge: spawns and speaks MCP to the upstream
//! `codex mcp-server` subprocess.

mod client;
mod discovery;
mod env;

pub use client::UpstreamClient;
pub use client::UpstreamError;
pub use discovery::discover_binary;
