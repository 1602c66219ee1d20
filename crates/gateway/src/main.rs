use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_domain::config::Config;
use relay_gateway::api;
use relay_gateway::runtime::{ContextManager, RunManager, StreamingFabric, ThreadManager, ToolDispatcher};
use relay_gateway::state::AppState;
use relay_llm::OpenAiClient;
use relay_sandbox::HttpSandboxProvider;
use relay_store::{InMemoryMessageStore, InMemoryProjectStore, JsonlMessageStore, KvStore};
use relay_tools::builtin::register_builtins;
use relay_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "relayd", about = "Relay agent-run execution service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Arc::new(Config::from_env().context("loading configuration")?);
            serve(config).await
        }
        Some(Command::Version) => {
            println!("relayd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Construct the object graph explicitly, leaves first:
/// config → KV → stores → sandbox provider → LLM client → tool registry
/// → fabric → dispatcher → context manager → thread manager → run
/// manager → HTTP.
async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    let kv = Arc::new(KvStore::new());
    if let Some(url) = &config.kv_url {
        tracing::info!(%url, "KV_URL set; using the in-process substrate for this build");
    }

    // Message log: JSONL files when a state dir is configured, otherwise
    // in-memory.
    let store: Arc<dyn relay_store::MessageStore> = match &config.state_dir {
        Some(dir) => {
            let path = std::path::Path::new(dir).join("threads");
            tracing::info!(dir = %path.display(), "persisting threads as JSONL");
            Arc::new(JsonlMessageStore::new(&path).context("opening thread store")?)
        }
        None => Arc::new(InMemoryMessageStore::new()),
    };
    let projects: Arc<dyn relay_store::ProjectStore> = Arc::new(InMemoryProjectStore::new());

    let sandbox: Arc<dyn relay_sandbox::SandboxProvider> =
        Arc::new(HttpSandboxProvider::from_config(&config.sandbox));
    let llm: Arc<dyn relay_llm::LlmClient> = Arc::new(OpenAiClient::from_config(&config.llm));

    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry, sandbox.clone(), config.search_provider_url.clone())
        .context("registering built-in tools")?;
    tracing::info!(tools = registry.len(), "tool registry ready");

    let fabric = Arc::new(StreamingFabric::new(kv.clone(), config.runtime.response_list_ttl));
    let dispatcher = Arc::new(ToolDispatcher::new(
        registry.clone(),
        fabric.clone(),
        config.runtime.tool_timeout,
    ));
    let context = Arc::new(ContextManager::new(llm.clone(), store.clone(), config.clone()));
    let threads = Arc::new(ThreadManager::new(
        store.clone(),
        llm,
        registry,
        dispatcher,
        context,
        fabric.clone(),
        config.clone(),
    ));
    let manager = Arc::new(RunManager::new(
        config.clone(),
        projects,
        store,
        sandbox,
        kv,
        fabric,
        threads,
    ));

    let state = AppState {
        api_token_hash: api::auth::token_hash(config.server.api_token.as_deref()),
        config: config.clone(),
        manager,
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, workers = config.runtime.worker_pool_size, "relayd listening");

    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}
