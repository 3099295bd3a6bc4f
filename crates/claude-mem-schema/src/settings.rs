//! Worker configuration.
//!
//! Precedence per key: environment variable > `settings.json` in the data
//! directory > built-in default. `settings.json` is a flat object whose keys
//! are the same names as the environment variables, so a containerized
//! deployment can drive every knob through the environment alone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::Visibility;

pub const DATA_DIR: &str = "CLAUDE_MEM_DATA_DIR";
pub const WORKER_HOST: &str = "CLAUDE_MEM_WORKER_HOST";
pub const WORKER_PORT: &str = "CLAUDE_MEM_WORKER_PORT";
pub const LLM_PROVIDER: &str = "CLAUDE_MEM_LLM_PROVIDER";
pub const FALLBACK_PROVIDER: &str = "CLAUDE_MEM_FALLBACK_PROVIDER";
pub const CLAUDE_MODEL: &str = "CLAUDE_MEM_CLAUDE_MODEL";
pub const CLAUDE_API_KEY: &str = "CLAUDE_MEM_CLAUDE_API_KEY";
pub const CLAUDE_URL: &str = "CLAUDE_MEM_CLAUDE_URL";
pub const GEMINI_MODEL: &str = "CLAUDE_MEM_GEMINI_MODEL";
pub const GEMINI_API_KEY: &str = "CLAUDE_MEM_GEMINI_API_KEY";
pub const GEMINI_URL: &str = "CLAUDE_MEM_GEMINI_URL";
pub const OPENROUTER_MODEL: &str = "CLAUDE_MEM_OPENROUTER_MODEL";
pub const OPENROUTER_API_KEY: &str = "CLAUDE_MEM_OPENROUTER_API_KEY";
pub const OPENROUTER_URL: &str = "CLAUDE_MEM_OPENROUTER_URL";
pub const OLLAMA_MODEL: &str = "CLAUDE_MEM_OLLAMA_MODEL";
pub const OLLAMA_URL: &str = "CLAUDE_MEM_OLLAMA_URL";
pub const MAX_CONTEXT_MESSAGES: &str = "CLAUDE_MEM_MAX_CONTEXT_MESSAGES";
pub const MAX_CONTEXT_TOKENS: &str = "CLAUDE_MEM_MAX_CONTEXT_TOKENS";
pub const LLM_TIMEOUT_SECONDS: &str = "CLAUDE_MEM_LLM_TIMEOUT_SECONDS";
pub const DEFAULT_VISIBILITY: &str = "CLAUDE_MEM_DEFAULT_VISIBILITY";
pub const AGENT_KEY_EXPIRY_DAYS: &str = "CLAUDE_MEM_AGENT_KEY_EXPIRY_DAYS";
pub const LOCKOUT_SECONDS: &str = "CLAUDE_MEM_LOCKOUT_SECONDS";
pub const MAX_FAILED_ATTEMPTS: &str = "CLAUDE_MEM_MAX_FAILED_ATTEMPTS";
pub const SEARCH_RECENCY_DAYS: &str = "CLAUDE_MEM_SEARCH_RECENCY_DAYS";
pub const GIT_REMOTE_ORDER: &str = "CLAUDE_MEM_GIT_REMOTE_ORDER";
pub const SKIP_TOOLS: &str = "CLAUDE_MEM_SKIP_TOOLS";
pub const VECTOR_MODE: &str = "CLAUDE_MEM_VECTOR_MODE";
pub const VECTOR_URL: &str = "CLAUDE_MEM_VECTOR_URL";
pub const ALIAS_EXPANSION_CAP: &str = "CLAUDE_MEM_ALIAS_EXPANSION_CAP";
pub const STALE_PROCESSING_SECONDS: &str = "CLAUDE_MEM_STALE_PROCESSING_SECONDS";
pub const RATE_LIMIT_PER_MINUTE: &str = "CLAUDE_MEM_RATE_LIMIT_PER_MINUTE";
pub const RATE_LIMIT_BURST: &str = "CLAUDE_MEM_RATE_LIMIT_BURST";
pub const CONTEXT_OBSERVATIONS: &str = "CLAUDE_MEM_CONTEXT_OBSERVATIONS";
pub const CONTEXT_SUMMARIES: &str = "CLAUDE_MEM_CONTEXT_SUMMARIES";
pub const MODE: &str = "CLAUDE_MEM_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Gemini,
    OpenRouter,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(ProviderKind::Claude),
            "gemini" => Some(ProviderKind::Gemini),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "ollama" => Some(ProviderKind::Ollama),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMode {
    Auto,
    Http,
    Embedded,
    Disabled,
}

impl VectorMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(VectorMode::Auto),
            "http" => Some(VectorMode::Http),
            "embedded" => Some(VectorMode::Embedded),
            "disabled" => Some(VectorMode::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub worker_host: String,
    pub worker_port: u16,
    pub llm_provider: ProviderKind,
    pub fallback_provider: Option<ProviderKind>,
    pub claude: ProviderSettings,
    pub gemini: ProviderSettings,
    pub openrouter: ProviderSettings,
    pub ollama: ProviderSettings,
    pub max_context_messages: usize,
    pub max_context_tokens: usize,
    pub llm_timeout_seconds: u64,
    pub default_visibility: Visibility,
    pub agent_key_expiry_days: i64,
    pub lockout_seconds: i64,
    pub max_failed_attempts: i64,
    pub search_recency_days: i64,
    pub git_remote_order: Vec<String>,
    pub skip_tools: Vec<String>,
    pub vector_mode: VectorMode,
    pub vector_url: String,
    pub alias_expansion_cap: usize,
    pub stale_processing_seconds: i64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub context_observations: usize,
    pub context_summaries: usize,
    pub mode: String,
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("claude-mem.db")
    }

    /// True when the selected provider carries enough configuration to build
    /// a client. Ollama is keyless and counts as configured whenever it is
    /// selected; the cloud providers need an api key. Readiness treats an
    /// unconfigured provider as vacuously healthy.
    pub fn provider_configured(&self) -> bool {
        match self.llm_provider {
            ProviderKind::Claude => self.claude.api_key.is_some(),
            ProviderKind::Gemini => self.gemini.api_key.is_some(),
            ProviderKind::OpenRouter => self.openrouter.api_key.is_some(),
            ProviderKind::Ollama => true,
        }
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vector-db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn modes_dir(&self) -> PathBuf {
        self.data_dir.join("modes")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.worker_host, self.worker_port)
    }

    /// Resolve settings from the process environment and the data
    /// directory's `settings.json`. `data_dir_override` wins over the
    /// `CLAUDE_MEM_DATA_DIR` variable.
    pub fn load(data_dir_override: Option<PathBuf>) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        let data_dir = data_dir_override
            .or_else(|| env.get(DATA_DIR).map(PathBuf::from))
            .unwrap_or_else(default_data_dir);
        let file = read_settings_file(&data_dir.join("settings.json"));
        Self::from_sources(data_dir, &file, &env)
    }

    /// Pure resolution from explicit sources. Environment wins over the
    /// file, the file wins over defaults.
    pub fn from_sources(
        data_dir: PathBuf,
        file: &serde_json::Map<String, Value>,
        env: &HashMap<String, String>,
    ) -> Self {
        let get = |key: &str| -> Option<String> {
            if let Some(v) = env.get(key) {
                return Some(v.clone());
            }
            file.get(key).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        };
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let llm_provider = ProviderKind::parse(&get_or(LLM_PROVIDER, "claude"))
            .unwrap_or(ProviderKind::Claude);
        let fallback_provider = get(FALLBACK_PROVIDER)
            .as_deref()
            .and_then(ProviderKind::parse)
            .filter(|p| *p != llm_provider);

        Settings {
            worker_host: get_or(WORKER_HOST, "127.0.0.1"),
            worker_port: parse_num(get(WORKER_PORT), 37777, WORKER_PORT),
            llm_provider,
            fallback_provider,
            claude: ProviderSettings {
                model: get_or(CLAUDE_MODEL, "claude-3-5-haiku-latest"),
                api_key: get(CLAUDE_API_KEY),
                base_url: get(CLAUDE_URL),
            },
            gemini: ProviderSettings {
                model: get_or(GEMINI_MODEL, "gemini-2.0-flash"),
                api_key: get(GEMINI_API_KEY),
                base_url: get(GEMINI_URL),
            },
            openrouter: ProviderSettings {
                model: get_or(OPENROUTER_MODEL, "anthropic/claude-3.5-haiku"),
                api_key: get(OPENROUTER_API_KEY),
                base_url: get(OPENROUTER_URL),
            },
            ollama: ProviderSettings {
                model: get_or(OLLAMA_MODEL, "llama3.1"),
                api_key: None,
                base_url: get(OLLAMA_URL),
            },
            max_context_messages: parse_num(get(MAX_CONTEXT_MESSAGES), 40, MAX_CONTEXT_MESSAGES),
            max_context_tokens: parse_num(get(MAX_CONTEXT_TOKENS), 32_000, MAX_CONTEXT_TOKENS),
            llm_timeout_seconds: parse_num(get(LLM_TIMEOUT_SECONDS), 120, LLM_TIMEOUT_SECONDS),
            default_visibility: get(DEFAULT_VISIBILITY)
                .as_deref()
                .and_then(Visibility::parse)
                .unwrap_or_default(),
            agent_key_expiry_days: parse_num(get(AGENT_KEY_EXPIRY_DAYS), 90, AGENT_KEY_EXPIRY_DAYS),
            lockout_seconds: parse_num(get(LOCKOUT_SECONDS), 300, LOCKOUT_SECONDS),
            max_failed_attempts: parse_num(get(MAX_FAILED_ATTEMPTS), 5, MAX_FAILED_ATTEMPTS),
            search_recency_days: parse_num(get(SEARCH_RECENCY_DAYS), 0, SEARCH_RECENCY_DAYS),
            git_remote_order: split_list(&get_or(GIT_REMOTE_ORDER, "origin,upstream")),
            skip_tools: split_list(&get_or(SKIP_TOOLS, "")),
            vector_mode: VectorMode::parse(&get_or(VECTOR_MODE, "auto")).unwrap_or(VectorMode::Auto),
            vector_url: get_or(VECTOR_URL, "http://127.0.0.1:8000"),
            alias_expansion_cap: parse_num(get(ALIAS_EXPANSION_CAP), 20, ALIAS_EXPANSION_CAP),
            stale_processing_seconds: parse_num(
                get(STALE_PROCESSING_SECONDS),
                900,
                STALE_PROCESSING_SECONDS,
            ),
            rate_limit_per_minute: parse_num(get(RATE_LIMIT_PER_MINUTE), 30, RATE_LIMIT_PER_MINUTE),
            rate_limit_burst: parse_num(get(RATE_LIMIT_BURST), 10, RATE_LIMIT_BURST),
            context_observations: parse_num(get(CONTEXT_OBSERVATIONS), 10, CONTEXT_OBSERVATIONS),
            context_summaries: parse_num(get(CONTEXT_SUMMARIES), 3, CONTEXT_SUMMARIES),
            mode: get_or(MODE, "default"),
            data_dir,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-mem")
}

fn read_settings_file(path: &Path) -> serde_json::Map<String, Value> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return serde_json::Map::new();
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = %path.display(), "settings.json is not a JSON object, ignoring");
            serde_json::Map::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse settings.json, ignoring");
            serde_json::Map::new()
        }
    }
}

fn parse_num<T: std::str::FromStr + Copy>(raw: Option<String>, default: T, key: &str) -> T {
    match raw {
        None => default,
        Some(s) => match s.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %s, "unparseable setting, using default");
                default
            }
        },
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn defaults_apply_when_sources_are_empty() {
        let s = Settings::from_sources(PathBuf::from("/tmp/cm"), &serde_json::Map::new(), &empty_env());
        assert_eq!(s.worker_port, 37777);
        assert_eq!(s.worker_host, "127.0.0.1");
        assert_eq!(s.llm_provider, ProviderKind::Claude);
        assert_eq!(s.search_recency_days, 0);
        assert_eq!(s.git_remote_order, vec!["origin", "upstream"]);
        assert!(s.skip_tools.is_empty());
        assert_eq!(s.vector_mode, VectorMode::Auto);
        assert_eq!(s.db_path(), PathBuf::from("/tmp/cm/claude-mem.db"));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = serde_json::Map::new();
        file.insert(WORKER_PORT.into(), Value::String("4100".into()));
        file.insert(SKIP_TOOLS.into(), Value::String("TodoWrite, Glob".into()));
        let s = Settings::from_sources(PathBuf::from("."), &file, &empty_env());
        assert_eq!(s.worker_port, 4100);
        assert_eq!(s.skip_tools, vec!["TodoWrite", "Glob"]);
    }

    #[test]
    fn env_overrides_file() {
        let mut file = serde_json::Map::new();
        file.insert(WORKER_PORT.into(), Value::String("4100".into()));
        let mut env = empty_env();
        env.insert(WORKER_PORT.into(), "5200".into());
        env.insert(LLM_PROVIDER.into(), "ollama".into());
        let s = Settings::from_sources(PathBuf::from("."), &file, &env);
        assert_eq!(s.worker_port, 5200);
        assert_eq!(s.llm_provider, ProviderKind::Ollama);
    }

    #[test]
    fn numeric_values_in_file_are_accepted() {
        let mut file = serde_json::Map::new();
        file.insert(MAX_FAILED_ATTEMPTS.into(), Value::Number(3.into()));
        let s = Settings::from_sources(PathBuf::from("."), &file, &empty_env());
        assert_eq!(s.max_failed_attempts, 3);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let mut env = empty_env();
        env.insert(WORKER_PORT.into(), "not-a-port".into());
        let s = Settings::from_sources(PathBuf::from("."), &serde_json::Map::new(), &env);
        assert_eq!(s.worker_port, 37777);
    }

    #[test]
    fn fallback_matching_primary_is_dropped() {
        let mut env = empty_env();
        env.insert(LLM_PROVIDER.into(), "claude".into());
        env.insert(FALLBACK_PROVIDER.into(), "claude".into());
        let s = Settings::from_sources(PathBuf::from("."), &serde_json::Map::new(), &env);
        assert_eq!(s.fallback_provider, None);
    }

    #[test]
    fn provider_configured_requires_a_key_for_cloud_providers() {
        let s = Settings::from_sources(PathBuf::from("."), &serde_json::Map::new(), &empty_env());
        assert_eq!(s.llm_provider, ProviderKind::Claude);
        assert!(!s.provider_configured());

        let mut env = empty_env();
        env.insert(CLAUDE_API_KEY.into(), "sk-test".into());
        let s = Settings::from_sources(PathBuf::from("."), &serde_json::Map::new(), &env);
        assert!(s.provider_configured());
    }

    #[test]
    fn ollama_counts_as_configured_without_a_key() {
        let mut env = empty_env();
        env.insert(LLM_PROVIDER.into(), "ollama".into());
        let s = Settings::from_sources(PathBuf::from("."), &serde_json::Map::new(), &env);
        assert!(s.provider_configured());
    }

    #[test]
    fn recency_zero_means_unlimited() {
        let mut env = empty_env();
        env.insert(SEARCH_RECENCY_DAYS.into(), "0".into());
        let s = Settings::from_sources(PathBuf::from("."), &serde_json::Map::new(), &env);
        assert_eq!(s.search_recency_days, 0);
    }
}
