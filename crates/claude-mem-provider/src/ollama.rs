//! Ollama native chat client. Uses `/api/chat` with `stream: false`, the
//! local embedded-LLM form; no API key involved.

use async_trait::async_trait;
use claude_mem_schema::ChatMessage;
use serde::{Deserialize, Serialize};

use crate::{
    truncate_history, HistoryLimits, LlmProvider, LlmReply, ProviderError, ProviderErrorKind,
};

const DEFAULT_BASE: &str = "http://localhost:11434";
const TEMPERATURE: f32 = 0.2;

pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    limits: HistoryLimits,
}

impl OllamaProvider {
    pub fn new(
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
    messages: Vec<ApiMessage>,
    stream: bool,
    options: ApiOptions,
}

#[derive(Serialize)]
struct ApiOptions {
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    message: Option<ApiMessage>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
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
            options: ApiOptions {
                temperature: TEMPERATURE,
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest("ollama", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                "ollama",
                ProviderErrorKind::from_status(status.as_u16()),
                format!("{status}: {body}"),
            ));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest("ollama", e))?;
        Ok(LlmReply {
            content: body.message.map(|m| m.content).unwrap_or_default(),
            input_tokens: body.prompt_eval_count,
            output_tokens: body.eval_count,
            provider_session_id: None,
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn health(&self) -> Result<(), ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest("ollama", e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::new(
                "ollama",
                ProviderErrorKind::from_status(resp.status().as_u16()),
                "tags endpoint unavailable",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base: String) -> OllamaProvider {
        OllamaProvider::new(
            "llama3.1",
            Some(base),
            std::time::Duration::from_secs(5),
            HistoryLimits {
                max_messages: 40,
                max_tokens: 32_000,
            },
        )
    }

    #[tokio::test]
    async fn run_uses_native_chat_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3.1",
                "stream": false,
                "options": {"temperature": 0.2}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "<memory>local</memory>"},
                "prompt_eval_count": 21,
                "eval_count": 8,
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = provider(server.uri())
            .run(&[ChatMessage::user("observe")])
            .await
            .unwrap();
        assert_eq!(reply.content, "<memory>local</memory>");
        assert_eq!(reply.input_tokens, 21);
        assert_eq!(reply.output_tokens, 8);
    }

    #[tokio::test]
    async fn health_checks_tags_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
            .mount(&server)
            .await;
        assert!(provider(server.uri()).health().await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let err = provider("http://127.0.0.1:1".into())
            .run(&[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
