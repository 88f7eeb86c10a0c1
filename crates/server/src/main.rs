mod api;
mod app_config;
mod relay;
mod router;
mod sessions;
mod state;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolbridge_core::Config;
use toolbridge_mcp::ConnectionSupervisor;

use crate::app_config::{build_provider, load_config};
use crate::state::AppState;

async fn serve(config: Config) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let supervisor = ConnectionSupervisor::from_config(&config.tool_provider, "toolbridge-server");
    let provider = build_provider(&config);
    let addr = config.server.bind_addr();

    let state = Arc::new(AppState::new(config, Arc::clone(&supervisor), provider));
    let app = router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    supervisor.stop().await;
    info!("Tool provider stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let config = load_config();
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        None | Some("serve") => serve(config).await?,
        Some("config") => {
            config.validate().context("invalid configuration")?;
            println!("{}", serde_json::to_string_pretty(&config.redacted_summary())?);
        }
        Some("profiles") => {
            for profile in Config::available_profiles() {
                println!("{}", profile);
            }
        }
        _ => {
            println!("toolbridge-server v{}", env!("CARGO_PKG_VERSION"));
            println!("Usage: toolbridge-server <command>");
            println!("  serve      Start the HTTP server (default)");
            println!("  config     Print the redacted configuration");
            println!("  profiles   List config profiles found in the environment");
        }
    }

    Ok(())
}
