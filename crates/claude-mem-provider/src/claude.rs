//! Anthropic Messages API client.

use async_trait::async_trait;
use claude_mem_schema::ChatMessage;
use serde::{Deserialize, Serialize};

use crate::{
    truncate_history, HistoryLimits, LlmProvider, LlmReply, ProviderError, ProviderErrorKind,
};

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct ClaudeProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    limits: HistoryLimits,
}

impl ClaudeProvider {
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
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    async fn run(&self, history: &[ChatMessage]) -> Result<LlmReply, ProviderError> {
        let history = truncate_history(history, self.limits);
        let payload = ApiRequest {
            model: &self.model,
            max_tokens: MAX_OUTPUT_TOKENS,
            messages: history
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.as_str(),
                    content: m.content.clone(),
                })
                .collect(),
        };

        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest("claude", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                "claude",
                ProviderErrorKind::from_status(status.as_u16()),
                format!("{status}: {body}"),
            ));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest("claude", e))?;
        let content = body
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(LlmReply {
            content,
            input_tokens: body.usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
            output_tokens: body.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
            provider_session_id: None,
        })
    }

    fn name(&self) -> &'static str {
        "claude"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base: String) -> ClaudeProvider {
        ClaudeProvider::new(
            "sk-test",
            "claude-3-5-haiku-latest",
            Some(base),
            std::time::Duration::from_secs(5),
            HistoryLimits {
                max_messages: 40,
                max_tokens: 32_000,
            },
        )
    }

    #[tokio::test]
    async fn run_sends_history_and_parses_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(body_partial_json(json!({
                "model": "claude-3-5-haiku-latest",
                "messages": [
                    {"role": "user", "content": "observe"},
                    {"role": "assistant", "content": "<memory></memory>"},
                    {"role": "user", "content": "next"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "<memory>ok</memory>"}],
                "usage": {"input_tokens": 12, "output_tokens": 34},
                "stop_reason": "end_turn"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let history = vec![
            ChatMessage::user("observe"),
            ChatMessage::assistant("<memory></memory>"),
            ChatMessage::user("next"),
        ];
        let reply = provider(server.uri()).run(&history).await.unwrap();
        assert_eq!(reply.content, "<memory>ok</memory>");
        assert_eq!(reply.input_tokens, 12);
        assert_eq!(reply.output_tokens, 34);
        assert!(reply.provider_session_id.is_none());
    }

    #[tokio::test]
    async fn rate_limit_is_recoverable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "type": "error",
                "error": {"type": "rate_limit_error", "message": "slow down"}
            })))
            .mount(&server)
            .await;

        let err = provider(server.uri())
            .run(&[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimit);
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn bad_request_is_unrecoverable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_string("malformed"))
            .mount(&server)
            .await;

        let err = provider(server.uri())
            .run(&[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
        assert!(!err.is_recoverable());
    }
}
