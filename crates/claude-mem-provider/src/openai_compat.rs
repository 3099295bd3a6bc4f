//! OpenAI-compatible chat completions client. OpenRouter is the shipped
//! preset; any endpoint speaking the same shape works through `custom`.

use async_trait::async_trait;
use claude_mem_schema::ChatMessage;
use serde::{Deserialize, Serialize};

use crate::{
    truncate_history, HistoryLimits, LlmProvider, LlmReply, ProviderError, ProviderErrorKind,
};

const OPENROUTER_BASE: &str = "https://openrouter.ai/api/v1";

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    name: &'static str,
    api_key: String,
    model: String,
    base_url: String,
    limits: HistoryLimits,
}

impl OpenAiCompatProvider {
    pub fn openrouter(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: Option<String>,
        timeout: std::time::Duration,
        limits: HistoryLimits,
    ) -> Self {
        Self::custom(
            "openrouter",
            api_key,
            model,
            base_url.unwrap_or_else(|| OPENROUTER_BASE.to_string()),
            timeout,
            limits,
        )
    }

    pub fn custom(
        name: &'static str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: std::time::Duration,
        limits: HistoryLimits,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            name,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limits,
        }
    }
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn run(&self, history: &[ChatMessage]) -> Result<LlmReply, ProviderError> {
        let history = truncate_history(history, self.limits);
        let payload = ApiRequest {
            model: &self.model,
            messages: history
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.name, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                self.name,
                ProviderErrorKind::from_status(status.as_u16()),
                format!("{status}: {body}"),
            ));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.name, e))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(LlmReply {
            content,
            input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: body.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            provider_session_id: None,
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
