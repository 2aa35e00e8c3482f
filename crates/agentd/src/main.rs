//! Agent daemon: wires the broker, state store, model clients, tools, and
//! memory modules together and runs one agent's processing loop until
//! SIGINT or a `shutdown` tool call.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use murmur_config::AgentConfig;
use murmur_fabric::Broker;
use murmur_llm::GeminiClient;
use murmur_memory::{GeminiEmbedder, MemoryCreator, MemoryRetriever, MemoryStore};
use murmur_runtime::Agent;
use murmur_store::{GatewayEgress, GatewayStore, InternalKey, StateStore};
use murmur_tools::{
    EditSystemPromptTool, HangUpTool, ReadSystemPromptTool, SendUserMessageTool, ShutdownTool,
    SleepRegistry, SleepTool, SpeakTool, ToolChannel, ToolRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "murmur-agentd", about = "Run a single agent's processing loop")]
struct Cli {
    /// Stable agent identifier, conventionally suffixed `_agent`.
    #[arg(long)]
    agent_name: String,

    /// Human-readable display name. Defaults to the agent name.
    #[arg(long)]
    display_name: Option<String>,

    /// Static description used when no prompt file or database prompt
    /// exists.
    #[arg(long)]
    description: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let display_name = cli.display_name.clone().unwrap_or_else(|| cli.agent_name.clone());

    let config = AgentConfig::from_env(&cli.agent_name, &display_name)
        .context("resolving agent configuration")?;
    config.setup_logging();
    info!(agent = %config.agent_name, "configuration loaded");

    let broker = Arc::new(
        Broker::connect(config.broker_path())
            .await
            .context("connecting to notification broker")?,
    );

    let key = Arc::new(InternalKey::load(&config.internal_key_path).await);
    let gateway = Arc::new(GatewayStore::new(
        &config.api_gateway_url,
        &config.agent_name,
        key,
    )?);
    let store: Arc<dyn StateStore> = gateway.clone();
    let egress: Arc<dyn GatewayEgress> = gateway.clone();

    let llm = Arc::new(GeminiClient::new(&config.gemini_api_key)?);
    let embedder = Arc::new(GeminiEmbedder::new(&config.gemini_api_key)?);
    let memory_store = Arc::new(
        MemoryStore::open(config.memory_store_path()).context("opening memory store")?,
    );

    let sleep_registry = Arc::new(SleepRegistry::new());
    let channel = ToolChannel::new(&config.agent_name, broker.clone());

    let mut tools = ToolRegistry::default();
    tools.register(Arc::new(SendUserMessageTool::new(
        channel.clone(),
        egress.clone(),
    )));
    tools.register(Arc::new(SleepTool::new(
        channel.clone(),
        store.clone(),
        sleep_registry.clone(),
    )));
    tools.register(Arc::new(ShutdownTool::new(channel.clone(), store.clone())));
    tools.register(Arc::new(SpeakTool::new(channel.clone())));
    tools.register(Arc::new(HangUpTool::new(channel.clone())));
    tools.register(Arc::new(ReadSystemPromptTool::new(
        channel.clone(),
        config.system_prompt_path.clone(),
    )));
    tools.register(Arc::new(EditSystemPromptTool::new(
        channel.clone(),
        config.system_prompt_path.clone(),
    )));

    let creator = MemoryCreator::new(
        &config.agent_name,
        llm.clone(),
        memory_store.clone(),
        embedder.clone(),
        store.clone(),
        config.memory.creator_enabled,
        config.memory.creator_run_every_n_turns,
        config.memory.creator_context_messages,
    );
    let retriever = MemoryRetriever::new(
        &config.agent_name,
        llm.clone(),
        memory_store,
        embedder,
        config.memory.retriever_enabled,
        config.memory.retriever_run_every_n_turns,
        config.memory.retriever_context_messages,
        config.memory.retriever_max_iterations,
    );

    let description = cli.description.unwrap_or_else(|| {
        format!("You are {display_name}, an autonomous assistant agent.")
    });

    let mut agent = Agent::new(
        config,
        &description,
        broker,
        store,
        egress,
        llm,
        tools,
        sleep_registry,
        Some(creator),
        Some(retriever),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    agent.run(shutdown_rx).await
}
