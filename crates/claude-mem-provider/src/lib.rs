//! Pluggable LLM clients.
//!
//! Every provider exposes the same contract: hand it the full ordered
//! conversation history, get back the assistant text plus usage counters.
//! Providers truncate oversized histories themselves (oldest messages drop
//! first, keeping a contiguous suffix), classify their errors into
//! recoverable and unrecoverable kinds, and can be chained through
//! [`FallbackProvider`].

mod claude;
mod gemini;
mod ollama;
mod openai_compat;

pub use claude::ClaudeProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatProvider;

use std::sync::Arc;

use async_trait::async_trait;
use claude_mem_schema::settings::{ProviderKind, Settings};
use claude_mem_schema::ChatMessage;
use thiserror::Error;
use tracing::warn;

/// Rough token estimate used by the truncation budget.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimit,
    ServerError,
    Timeout,
    Network,
    Auth,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit,
            401 | 403 => Self::Auth,
            400 | 404 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Recoverable errors are worth a retry or a fallback provider; the rest
    /// would fail the same way again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::Timeout | Self::Network
        )
    }
}

#[derive(Debug, Error)]
#[error("{provider} error ({kind:?}): {message}")]
pub struct ProviderError {
    pub provider: &'static str,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: &'static str, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: message.into(),
        }
    }

    pub fn from_reqwest(provider: &'static str, e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            ProviderErrorKind::Timeout
        } else if e.is_connect() {
            ProviderErrorKind::Network
        } else if let Some(status) = e.status() {
            ProviderErrorKind::from_status(status.as_u16())
        } else {
            ProviderErrorKind::Unknown
        };
        Self::new(provider, kind, e.to_string())
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

/// One completed round-trip.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Some providers hand back their own conversation id; most do not, and
    /// the session manager mints one on the first successful round.
    pub provider_session_id: Option<String>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn run(&self, history: &[ChatMessage]) -> Result<LlmReply, ProviderError>;

    fn name(&self) -> &'static str;

    /// Cheap reachability probe for the readiness endpoint.
    async fn health(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// History budget applied before each request.
#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub max_messages: usize,
    pub max_tokens: usize,
}

impl HistoryLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_messages: settings.max_context_messages,
            max_tokens: settings.max_context_tokens,
        }
    }
}

/// Keep the newest contiguous suffix of `history` that fits both budgets.
/// The newest message is always kept, even when it alone blows the budget.
pub fn truncate_history(history: &[ChatMessage], limits: HistoryLimits) -> Vec<ChatMessage> {
    if history.is_empty() {
        return Vec::new();
    }
    let budget_chars = limits.max_tokens.max(1) * CHARS_PER_TOKEN;
    let max_messages = limits.max_messages.max(1);
    let mut chars = 0_usize;
    let mut start = history.len();
    for (i, message) in history.iter().enumerate().rev() {
        let is_newest = i == history.len() - 1;
        let within_count = history.len() - i <= max_messages;
        let within_budget = chars + message.content.len() <= budget_chars;
        if is_newest || (within_count && within_budget) {
            chars += message.content.len();
            start = i;
        } else {
            break;
        }
    }
    if start > 0 {
        warn!(
            dropped = start,
            kept = history.len() - start,
            "truncated conversation history to fit provider budget"
        );
    }
    history[start..].to_vec()
}

/// Chains two providers: recoverable primary failures replay the same
/// history against the fallback.
pub struct FallbackProvider {
    primary: Arc<dyn LlmProvider>,
    fallback: Arc<dyn LlmProvider>,
}

impl FallbackProvider {
    pub fn new(primary: Arc<dyn LlmProvider>, fallback: Arc<dyn LlmProvider>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl LlmProvider for FallbackProvider {
    async fn run(&self, history: &[ChatMessage]) -> Result<LlmReply, ProviderError> {
        match self.primary.run(history).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_recoverable() => {
                warn!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    error = %e,
                    "primary provider failed, trying fallback"
                );
                self.fallback.run(history).await
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn health(&self) -> Result<(), ProviderError> {
        if self.primary.health().await.is_ok() {
            return Ok(());
        }
        self.fallback.health().await
    }
}

/// Build one provider from settings.
pub fn build_provider(
    kind: ProviderKind,
    settings: &Settings,
) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let limits = HistoryLimits::from_settings(settings);
    let timeout = std::time::Duration::from_secs(settings.llm_timeout_seconds);
    let provider: Arc<dyn LlmProvider> = match kind {
        ProviderKind::Claude => {
            let key = settings.claude.api_key.clone().ok_or_else(|| {
                ProviderError::new(
                    "claude",
                    ProviderErrorKind::Auth,
                    "claude provider requires an api key",
                )
            })?;
            Arc::new(ClaudeProvider::new(
                key,
                settings.claude.model.clone(),
                settings.claude.base_url.clone(),
                timeout,
                limits,
            ))
        }
        ProviderKind::Gemini => {
            let key = settings.gemini.api_key.clone().ok_or_else(|| {
                ProviderError::new(
                    "gemini",
                    ProviderErrorKind::Auth,
                    "gemini provider requires an api key",
                )
            })?;
            Arc::new(GeminiProvider::new(
                key,
                settings.gemini.model.clone(),
                settings.gemini.base_url.clone(),
                timeout,
                limits,
            ))
        }
        ProviderKind::OpenRouter => {
            let key = settings.openrouter.api_key.clone().ok_or_else(|| {
                ProviderError::new(
                    "openrouter",
                    ProviderErrorKind::Auth,
                    "openrouter provider requires an api key",
                )
            })?;
            Arc::new(OpenAiCompatProvider::openrouter(
                key,
                settings.openrouter.model.clone(),
                settings.openrouter.base_url.clone(),
                timeout,
                limits,
            ))
        }
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(
            settings.ollama.model.clone(),
            settings.ollama.base_url.clone(),
            timeout,
            limits,
        )),
    };
    Ok(provider)
}

/// Build the configured provider, wrapped with the configured fallback when
/// one is set.
pub fn build_from_settings(settings: &Settings) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let primary = build_provider(settings.llm_provider, settings)?;
    match settings.fallback_provider {
        Some(kind) => {
            let fallback = build_provider(kind, settings)?;
            Ok(Arc::new(FallbackProvider::new(primary, fallback)))
        }
        None => Ok(primary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(content: &str) -> ChatMessage {
        ChatMessage::user(content)
    }

    #[test]
    fn truncation_keeps_newest_suffix_by_count() {
        let history: Vec<ChatMessage> = (0..10).map(|i| msg(&format!("m{i}"))).collect();
        let kept = truncate_history(
            &history,
            HistoryLimits {
                max_messages: 4,
                max_tokens: 10_000,
            },
        );
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0].content, "m6");
        assert_eq!(kept[3].content, "m9");
    }

    #[test]
    fn truncation_respects_token_budget() {
        // Each message is ~100 chars = ~25 tokens; a 60-token budget fits two.
        let history: Vec<ChatMessage> = (0..5).map(|_| msg(&"x".repeat(100))).collect();
        let kept = truncate_history(
            &history,
            HistoryLimits {
                max_messages: 100,
                max_tokens: 60,
            },
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn truncation_always_keeps_the_newest_message() {
        let history = vec![msg(&"y".repeat(10_000))];
        let kept = truncate_history(
            &history,
            HistoryLimits {
                max_messages: 10,
                max_tokens: 1,
            },
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn no_truncation_when_under_budget() {
        let history: Vec<ChatMessage> = (0..3).map(|i| msg(&format!("m{i}"))).collect();
        let kept = truncate_history(
            &history,
            HistoryLimits {
                max_messages: 10,
                max_tokens: 1_000,
            },
        );
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn error_kind_classification() {
        assert_eq!(ProviderErrorKind::from_status(429), ProviderErrorKind::RateLimit);
        assert_eq!(ProviderErrorKind::from_status(500), ProviderErrorKind::ServerError);
        assert_eq!(ProviderErrorKind::from_status(401), ProviderErrorKind::Auth);
        assert_eq!(ProviderErrorKind::from_status(400), ProviderErrorKind::InvalidRequest);
        assert!(ProviderErrorKind::RateLimit.is_recoverable());
        assert!(ProviderErrorKind::Timeout.is_recoverable());
        assert!(ProviderErrorKind::Network.is_recoverable());
        assert!(!ProviderErrorKind::Auth.is_recoverable());
        assert!(!ProviderErrorKind::InvalidRequest.is_recoverable());
    }

    struct ScriptedProvider {
        name: &'static str,
        calls: AtomicUsize,
        error: Option<ProviderErrorKind>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn run(&self, _history: &[ChatMessage]) -> Result<LlmReply, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.error {
                Some(kind) => Err(ProviderError::new(self.name, kind, "scripted")),
                None => Ok(LlmReply {
                    content: format!("from {}", self.name),
                    input_tokens: 1,
                    output_tokens: 2,
                    provider_session_id: None,
                }),
            }
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    #[tokio::test]
    async fn fallback_engages_on_recoverable_errors() {
        let primary = Arc::new(ScriptedProvider {
            name: "primary",
            calls: AtomicUsize::new(0),
            error: Some(ProviderErrorKind::Timeout),
        });
        let fallback = Arc::new(ScriptedProvider {
            name: "fallback",
            calls: AtomicUsize::new(0),
            error: None,
        });
        let chained = FallbackProvider::new(primary.clone(), fallback.clone());

        let reply = chained.run(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(reply.content, "from fallback");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_skipped_on_unrecoverable_errors() {
        let primary = Arc::new(ScriptedProvider {
            name: "primary",
            calls: AtomicUsize::new(0),
            error: Some(ProviderErrorKind::Auth),
        });
        let fallback = Arc::new(ScriptedProvider {
            name: "fallback",
            calls: AtomicUsize::new(0),
            error: None,
        });
        let chained = FallbackProvider::new(primary, fallback.clone());

        let err = chained.run(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Auth);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }
}
