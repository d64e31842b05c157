use codex_bridge_server::run_main;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    run_main().await
}
