use anyhow::{Context, Result};
use clap::Parser;
use forge_core::auth::{AdminAuthenticator, Authenticator, TrustAuthenticator, VerifyAuthenticator};
use forge_core::config::{ConfigHandle, RuntimeOverlay};
use forge_core::domain::{Agent, ToolSpec};
use forge_core::rate_limit::{InProcessRateLimiter, RateLimitConfig, RateLimiter};
use forge_core::react::{HttpToolDispatcher, LlmTurn, ToolDispatcher};
use forge_core::store::{
    AgentStore, ConversationStore, InMemoryAgentStore, InMemoryConversationStore, InMemoryPreferencesStore,
    InMemoryPromptStore, InMemoryToolStore, PreferencesStore, PromptStore, ToolStore,
};
use forge_core::verifier::{StaticVerifierRegistry, VerifierRunner};
use forge_core::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod backends;
mod chat_support;
mod common;
mod error_response;
mod handlers;
mod llm;
mod router;
mod sink;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// Runtime config overlay (JSON, `${VAR}` substitution). In-process
    /// defaults are used when absent.
    #[arg(long, env = "FORGE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// JSON array of agent profiles to seed the agent registry with.
    #[arg(long, env = "FORGE_AGENTS_PATH")]
    agents: Option<PathBuf>,

    /// JSON array of tool specs to seed the tool registry with.
    #[arg(long, env = "FORGE_TOOLS_PATH")]
    tools: Option<PathBuf>,

    /// Base URL tool calls are dispatched against.
    #[arg(long, default_value = "http://localhost:8081")]
    tools_base_url: String,

    /// Bearer key required on `/forge-admin/*`. Unset fails every admin
    /// request closed with 503.
    #[arg(long, env = "FORGE_ADMIN_KEY")]
    admin_key: Option<String>,

    /// HMAC-SHA256 signing key. Presence switches auth from trust-mode
    /// (decode without verifying) to verify-mode.
    #[arg(long, env = "JWT_SIGNING_KEY")]
    jwt_signing_key: Option<String>,

    /// Claim holding the caller's identity inside the JWT payload.
    #[arg(long, default_value = "sub")]
    jwt_claim_path: String,

    /// sqlite file backing conversations, prompts, preferences, and audit
    /// rows. In-memory stores are used when absent.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL: moves the HITL store and rate limiter onto a shared
    /// backend so multiple instances can coordinate.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, default_value_t = 60)]
    rate_limit_max_requests: u64,

    #[arg(long, default_value_t = 60)]
    rate_limit_window_secs: u64,

    /// How often the HITL store sweeps rows past their TTL. Only runs
    /// when a HITL store is configured (sqlite or redis).
    #[arg(long, default_value_t = 60)]
    hitl_cleanup_interval_secs: u64,
}

fn load_seed<T: serde::de::DeserializeOwned>(path: Option<&PathBuf>) -> Result<Vec<T>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading seed file {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
        }
        None => Ok(Vec::new()),
    }
}

async fn build_state(args: &Args) -> Result<Arc<AppState>> {
    let overlay = match &args.config {
        Some(path) => RuntimeOverlay::load_from_file(path).context("failed to load runtime config")?,
        None => RuntimeOverlay::default(),
    };
    let config = Arc::new(ConfigHandle::new(overlay));

    let agents = load_seed::<Agent>(args.agents.as_ref())?;
    let tool_seed = load_seed::<ToolSpec>(args.tools.as_ref())?;

    let agent_store: Arc<dyn AgentStore> = Arc::new(InMemoryAgentStore::new(agents));
    let tool_store: Arc<dyn ToolStore> = Arc::new(InMemoryToolStore::new(tool_seed));

    let authenticator: Arc<dyn Authenticator> = match &args.jwt_signing_key {
        Some(key) => Arc::new(VerifyAuthenticator { signing_key: key.clone(), claim_path: args.jwt_claim_path.clone() }),
        None => Arc::new(TrustAuthenticator { claim_path: args.jwt_claim_path.clone() }),
    };
    let admin_authenticator = AdminAuthenticator { admin_key: args.admin_key.clone() };

    let rate_limit_config = RateLimitConfig {
        max_requests: args.rate_limit_max_requests,
        window_secs: args.rate_limit_window_secs,
    };
    let rate_limiter: Arc<dyn RateLimiter> = match &args.redis_url {
        Some(url) => backends::build_shared_rate_limiter(rate_limit_config, url)?,
        None => Arc::new(InProcessRateLimiter::new(rate_limit_config)),
    };

    let (conversation_store, prompt_store, preferences_store, audit_sink): (
        Arc<dyn ConversationStore>,
        Arc<dyn PromptStore>,
        Arc<dyn PreferencesStore>,
        Arc<dyn forge_core::audit::AuditSink>,
    ) = match &args.database_url {
        Some(path) => (
            backends::open_conversation_store(path)?,
            backends::open_prompt_store(path)?,
            backends::open_preferences_store(path)?,
            backends::open_audit_sink(path)?,
        ),
        None => (
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(InMemoryPromptStore::new()),
            Arc::new(InMemoryPreferencesStore::new()),
            Arc::new(forge_core::audit::in_memory::InMemoryAuditSink::new()),
        ),
    };

    let hitl_engine = match (&args.redis_url, &args.database_url) {
        (Some(url), _) => Some(Arc::new(forge_core::hitl::HitlEngine::new(backends::open_redis_hitl_store(url)?))),
        (None, Some(path)) => Some(Arc::new(forge_core::hitl::HitlEngine::new(backends::open_sqlite_hitl_store(path)?))),
        (None, None) => Some(Arc::new(forge_core::hitl::HitlEngine::new(Arc::new(
            forge_core::hitl::in_memory::InMemoryHitlStore::new(),
        )))),
    };
    if let Some(engine) = &hitl_engine {
        engine.spawn_cleanup(std::time::Duration::from_secs(args.hitl_cleanup_interval_secs));
    }

    let verifier_runner = Arc::new(VerifierRunner::new(Box::new(StaticVerifierRegistry::new(Vec::new()))));

    let tool_dispatcher: Arc<dyn ToolDispatcher> =
        Arc::new(HttpToolDispatcher { base_url: args.tools_base_url.clone(), client: reqwest::Client::new() });
    let llm_turn: Arc<dyn LlmTurn> = Arc::new(llm::HttpLlmTurn::new());

    Ok(Arc::new(AppState {
        authenticator,
        admin_authenticator,
        rate_limiter,
        hitl_engine,
        verifier_runner,
        llm_turn,
        tool_dispatcher,
        conversation_store,
        prompt_store,
        agent_store,
        tool_store,
        preferences_store,
        audit_sink,
        config,
        config_path: args.config.clone(),
    }))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forge_service=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    let state = build_state(&args).await?;
    let app = router::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    tracing::info!(addr = %args.addr, "forge-service listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("shutting down: draining verifier worker pool and closing the conversation store");
    state.verifier_runner.shutdown().await;
    if let Err(e) = state.conversation_store.close().await {
        tracing::warn!(error = %e, "error closing conversation store during shutdown");
    }

    Ok(())
}
