use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use parley_config::{apply_process_env, find_config_path, load_config, Config};
use parley_core::provider::gemini::GeminiProvider;
use parley_core::tools::web::WebSearchTool;
use parley_core::tools::ToolRegistry;
use parley_core::AgentRegistry;
use parley_gateway::{AppState, ChatHub, HubFactory};

#[derive(Parser)]
#[command(name = "parley", about = "Conversation-bound AI assistant service", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and agent registry
    Serve,
    /// Query a running gateway for its agent status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},hyper=warn,parley_core::agent=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    let config = load(cli.config)?;

    match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Status => run_status(config).await,
    }
}

fn load(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(find_config_path);
    let mut config = load_config(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    apply_process_env(&mut config);
    Ok(config)
}

async fn run_serve(config: Config) -> Result<()> {
    if config.providers.gemini.api_key.is_empty() {
        warn!("no Gemini API key configured, agent starts will be rejected");
    }

    let provider = Arc::new(GeminiProvider::new(
        &config.providers.gemini,
        &config.agents.model,
    ));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(WebSearchTool::new(config.tools.search.clone())));
    let tools = Arc::new(tools);

    let hub = ChatHub::new();
    let factory = HubFactory::new(Arc::clone(&hub));
    let registry = Arc::new(AgentRegistry::new(
        factory,
        provider,
        tools,
        config.clone(),
    ));
    let reaper = registry.spawn_reaper();

    let state = AppState {
        hub,
        registry: Arc::clone(&registry),
    };
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let gateway = config.gateway.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = parley_gateway::run(&gateway, state, shutdown_rx).await {
            tracing::error!("gateway error: {e:#}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    let _ = shutdown_tx.send(());
    reaper.abort();
    registry.shutdown().await;
    let _ = server.await;
    Ok(())
}

async fn run_status(config: Config) -> Result<()> {
    let host = if config.gateway.host == "0.0.0.0" {
        "127.0.0.1"
    } else {
        config.gateway.host.as_str()
    };
    let url = format!("http://{host}:{}/api/agent/status", config.gateway.port);
    let status: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach gateway at {url}"))?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
