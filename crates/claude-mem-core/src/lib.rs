//! The worker's brain: project identity, agent registry, per-session
//! supervisors, LLM response processing, and the hybrid search engine.

pub mod agents;
pub mod processor;
pub mod project;
pub mod prompts;
pub mod search;
pub mod sessions;

pub use agents::{AgentError, AgentRegistry, RegisterOutcome};
pub use processor::{parse_response, ParsedResponse, ProcessOutcome, ResponseProcessor};
pub use search::{SearchEngine, SearchRequest, TimelineAnchor, TimelineEntry};
pub use sessions::SessionManager;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] claude_mem_store::StoreError),
    #[error(transparent)]
    Vector(#[from] claude_mem_vector::VectorError),
    #[error(transparent)]
    Provider(#[from] claude_mem_provider::ProviderError),
    #[error("not found: {0}")]
    NotFound(String),
}
