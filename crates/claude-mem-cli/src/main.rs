//! The `claude-mem` worker binary.
//!
//! Startup order matters: logging, settings, store (migrations are fatal on
//! failure), stale-claim recovery, vector backend, LLM provider, HTTP
//! server. Shutdown runs the same list backwards: stop accepting requests,
//! cancel the supervisors (each returns its in-flight claim to the queue),
//! flush the vector index, drop the store.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use claude_mem_core::{AgentRegistry, ResponseProcessor, SearchEngine, SessionManager};
use claude_mem_provider::{LlmProvider, LlmReply, ProviderError, ProviderErrorKind};
use claude_mem_schema::modes::load_modes;
use claude_mem_schema::settings::Settings;
use claude_mem_schema::{epoch_millis_now, ChatMessage};
use claude_mem_server::auth::{RateLimitConfig, RateLimiter};
use claude_mem_server::state::{AppState, Readiness};
use claude_mem_store::Store;
use claude_mem_vector::{resolve_index, VectorSync};

#[derive(Parser)]
#[command(name = "claude-mem", version, about = "Tool-event memory worker")]
struct Cli {
    /// Run the worker in the foreground.
    #[arg(long)]
    daemon: bool,

    /// Override the data directory (default: ~/.claude-mem, or
    /// CLAUDE_MEM_DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// Stands in when no usable LLM provider could be built. Every call fails
/// recoverably, so queued messages stay retry-eligible until the operator
/// fixes the configuration.
struct UnavailableProvider;

#[async_trait]
impl LlmProvider for UnavailableProvider {
    async fn run(&self, _history: &[ChatMessage]) -> Result<LlmReply, ProviderError> {
        Err(ProviderError::new(
            "unconfigured",
            ProviderErrorKind::Network,
            "no usable llm provider configured",
        ))
    }

    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn health(&self) -> Result<(), ProviderError> {
        Err(ProviderError::new(
            "unconfigured",
            ProviderErrorKind::Network,
            "no usable llm provider configured",
        ))
    }
}

fn init_logging(settings: &Settings) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(settings.logs_dir()).context("cannot create logs directory")?;
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("claude-mem")
        .filename_suffix("log")
        .build(settings.logs_dir())
        .context("cannot open log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = Settings::load(cli.data_dir.clone());
    if let Err(e) = std::fs::create_dir_all(&settings.data_dir) {
        eprintln!("cannot create data directory {}: {e}", settings.data_dir.display());
        std::process::exit(1);
    }
    let _log_guard = match init_logging(&settings) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logging setup failed: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(settings, cli.daemon).await {
        error!(error = %format!("{e:#}"), "worker failed");
        std::process::exit(1);
    }
}

async fn run(settings: Settings, daemon: bool) -> Result<()> {
    let settings = Arc::new(settings);
    info!(
        data_dir = %settings.data_dir.display(),
        daemon,
        "starting claude-mem worker"
    );

    // Migration failure is fatal; the process must not serve writes over a
    // half-migrated schema.
    let store = Store::open(&settings.db_path()).context("store open/migration failed")?;
    let readiness = Arc::new(Readiness::new());
    readiness.migrations_complete.store(true, Ordering::SeqCst);

    let stale_before = epoch_millis_now() - settings.stale_processing_seconds * 1_000;
    let recovered = store.reset_stale_processing(stale_before).await?;
    if recovered > 0 {
        info!(recovered, "returned stale processing messages to the queue");
    }

    let index = resolve_index(settings.vector_mode, &settings.vector_url, &settings.vector_dir())
        .await
        .context("vector index startup failed")?;
    let vector_sync = VectorSync::new(Arc::clone(&index), store.clone());

    let provider_configured = settings.provider_configured();
    readiness
        .provider_configured
        .store(provider_configured, Ordering::SeqCst);
    let provider: Arc<dyn LlmProvider> = if provider_configured {
        match claude_mem_provider::build_from_settings(&settings) {
            Ok(provider) => {
                match provider.health().await {
                    Ok(()) => readiness.provider_reachable.store(true, Ordering::SeqCst),
                    Err(e) => warn!(error = %e, "llm provider health probe failed"),
                }
                provider
            }
            Err(e) => {
                warn!(error = %e, "llm provider configuration unusable; messages will queue");
                Arc::new(UnavailableProvider)
            }
        }
    } else {
        // No provider configured at all: readiness ignores the provider leg
        // and queued messages wait until one is set.
        info!(
            provider = settings.llm_provider.as_str(),
            "llm provider not configured; messages will queue until a key is set"
        );
        Arc::new(UnavailableProvider)
    };

    let modes = load_modes(&settings.modes_dir()).context("mode definitions failed to load")?;
    let mode = modes
        .get(&settings.mode)
        .cloned()
        .unwrap_or_default();

    let shutdown = CancellationToken::new();
    let processor = ResponseProcessor::new(
        store.clone(),
        vector_sync.clone(),
        settings.default_visibility,
    );
    let sessions = SessionManager::new(
        store.clone(),
        Arc::clone(&provider),
        processor,
        vector_sync.clone(),
        mode,
        shutdown.clone(),
    );
    let search = SearchEngine::new(
        store.clone(),
        Arc::clone(&index),
        settings.search_recency_days,
        settings.alias_expansion_cap,
    );
    let registry = Arc::new(AgentRegistry::new(
        store.clone(),
        settings.max_failed_attempts,
        settings.lockout_seconds,
        settings.agent_key_expiry_days,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        requests_per_minute: settings.rate_limit_per_minute,
        burst: settings.rate_limit_burst,
    }));

    let state = AppState {
        store: store.clone(),
        sessions: sessions.clone(),
        search,
        registry,
        vector_sync,
        settings: Arc::clone(&settings),
        modes: Arc::new(modes),
        rate_limiter,
        readiness,
    };

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if wait_for_signal().await {
            info!("shutdown signal received");
        }
        server_shutdown.cancel();
    });

    claude_mem_server::serve(state, &settings.bind_addr(), shutdown.clone()).await?;

    // The listener is closed; drain the supervisors, then the index.
    sessions.shutdown().await;
    if let Err(e) = index.close().await {
        warn!(error = %e, "vector index close failed");
    }
    info!("clean shutdown");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return tokio::signal::ctrl_c().await.is_ok(),
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.is_ok(),
        _ = term.recv() => true,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    tokio::signal::ctrl_c().await.is_ok()
}
