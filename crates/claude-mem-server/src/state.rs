use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use claude_mem_core::{AgentRegistry, SearchEngine, SessionManager};
use claude_mem_schema::modes::Mode;
use claude_mem_schema::settings::Settings;
use claude_mem_store::Store;
use claude_mem_vector::VectorSync;

use crate::auth::RateLimiter;

/// Readiness flips true once migrations ran and, when an LLM provider is
/// configured, its startup health probe succeeded. With no provider
/// configured the provider leg is vacuously satisfied.
pub struct Readiness {
    pub migrations_complete: AtomicBool,
    pub provider_configured: AtomicBool,
    pub provider_reachable: AtomicBool,
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            migrations_complete: AtomicBool::new(false),
            provider_configured: AtomicBool::new(false),
            provider_reachable: AtomicBool::new(false),
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sessions: SessionManager,
    pub search: SearchEngine,
    pub registry: Arc<AgentRegistry>,
    pub vector_sync: VectorSync,
    pub settings: Arc<Settings>,
    pub modes: Arc<HashMap<String, Mode>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub readiness: Arc<Readiness>,
}

impl AppState {
    pub fn active_mode(&self) -> Mode {
        self.modes
            .get(&self.settings.mode)
            .cloned()
            .unwrap_or_default()
    }
}
