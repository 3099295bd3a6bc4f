//! Google Gemini generateContent client.

use async_trait::async_trait;
use claude_mem_schema::{ChatMessage, ChatRole};
use serde::{Deserialize, Serialize};

use crate::{
    truncate_history, HistoryLimits, LlmProvider, LlmReply, ProviderError, ProviderErrorKind,
};

const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    limits: HistoryLimits,
}

impl GeminiProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: Option<String>,
        timeout: std::time::Duration,
        limits: HistoryLimits,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            limits,
        }
    }
}

#[derive(Serialize)]
struct ApiRequest {
    contents: Vec<ApiContent>,
}

#[derive(Serialize, Deserialize)]
struct ApiContent {
    role: String,
    parts: Vec<ApiPart>,
}

#[derive(Serialize, Deserialize)]
struct ApiPart {
    text: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiCandidate {
    content: Option<ApiContent>,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn run(&self, history: &[ChatMessage]) -> Result<LlmReply, ProviderError> {
        let history = truncate_history(history, self.limits);
        let contents = history
            .iter()
            .map(|m| ApiContent {
                role: match m.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "model".to_string(),
                },
                parts: vec![ApiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&ApiRequest { contents })
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest("gemini", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                "gemini",
                ProviderErrorKind::from_status(status.as_u16()),
                format!("{status}: {body}"),
            ));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest("gemini", e))?;
        let content = body
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(LlmReply {
            content,
            input_tokens: body
                .usage_metadata
                .as_ref()
                .map(|u| u.prompt_token_count)
                .unwrap_or(0),
            output_tokens: body
                .usage_metadata
                .as_ref()
                .map(|u| u.candidates_token_count)
                .unwrap_or(0),
            provider_session_id: None,
        })
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}
