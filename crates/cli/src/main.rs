mod cli;
mod config;
mod terminal;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use toolbridge_core::Config;
use toolbridge_mcp::ConnectionSupervisor;
use toolbridge_runtime::{
    configured_preamble, ConversationEngine, EngineConfig, Notification, ToolCatalog,
};

use crate::cli::CliArgs;
use crate::config::CliConfig;
use crate::terminal::Terminal;

/// Run one turn, printing notifications while it streams. Ctrl+C drops the
/// turn and returns to the prompt.
async fn run_turn(
    engine: &mut ConversationEngine,
    terminal: &Terminal,
    input: String,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Notification>(64);

    let turn = async move { engine.send_message(input, &tx).await };
    let printer = async {
        while let Some(notification) = rx.recv().await {
            terminal.display_notification(&notification)?;
        }
        Ok::<_, anyhow::Error>(())
    };
    let work = async { tokio::join!(turn, printer) };

    tokio::select! {
        (result, printed) = work => {
            printed?;
            println!();
            match result {
                Ok(summary) => debug!(
                    model_calls = summary.model_calls,
                    tool_calls = summary.tool_calls,
                    depth = summary.depth,
                    "Turn finished"
                ),
                Err(e) => {
                    error!(error = %e, "Turn failed");
                    terminal.print_error(&e.to_string())?;
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            terminal.print_info("\n[cancelled]")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let terminal = Terminal::new();

    toolbridge_core::config::load_dotenv();
    let mut config = match args.profile.as_deref() {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    let file = CliConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    file.apply(&mut config, &args);
    config.validate().context("invalid configuration")?;

    let supervisor = ConnectionSupervisor::from_config(&config.tool_provider, "toolbridge-cli");

    if args.list_tools {
        supervisor
            .start()
            .await
            .context("failed to start tool provider")?;
        let catalog = ToolCatalog::fetch(supervisor.as_ref(), config.engine.catalog_timeout())
            .await
            .context("failed to list tools")?;
        terminal.print_tools(&catalog.list())?;
        supervisor.stop().await;
        return Ok(());
    }

    let provider =
        toolbridge_llm::create_provider(&config.llm).context("failed to create LLM provider")?;
    let mut engine = ConversationEngine::new(provider, supervisor.clone())
        .with_config(EngineConfig::from_config(&config))
        .with_preamble(configured_preamble(&config.engine));
    engine
        .start()
        .await
        .context("failed to start conversation")?;
    info!(command = %config.tool_provider.command_line(), "Tool provider ready");

    let tool_count = engine.catalog().map(|c| c.len()).unwrap_or(0);
    terminal.print_banner(&config.llm.model, &config.tool_provider.command, tool_count)?;

    loop {
        let input = match terminal.read_input()? {
            Some(text) => text,
            None => {
                terminal.print_info("Goodbye.")?;
                break;
            }
        };

        if input.is_empty() {
            continue;
        }

        run_turn(&mut engine, &terminal, input).await?;
    }

    engine.stop().await;
    supervisor.stop().await;
    Ok(())
}
