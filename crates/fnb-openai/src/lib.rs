//! OpenAI adapter (chat completions).
//!
//! One `POST {base_url}/chat/completions` per call. Timeouts and retries are
//! owned by the summarizer, so the HTTP client here only carries a connect
//! timeout.

use std::time::Duration;

use async_trait::async_trait;
use fnb_core::{
    errors::Error,
    model::{
        client::CompletionClient,
        types::{CompletionRequest, CompletionResult, ProviderKind, TokenUsage},
    },
    Result,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::External(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn request_body<'a>(model: &'a str, req: &'a CompletionRequest) -> ChatRequest<'a> {
    ChatRequest {
        model,
        messages: [
            ChatMessage {
                role: "system",
                content: &req.system_prompt,
            },
            ChatMessage {
                role: "user",
                content: &req.user_prompt,
            },
        ],
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        response_format: req.json_response.then_some(ResponseFormat {
            kind: "json_object",
        }),
    }
}

fn parse_body(body: &str) -> Result<CompletionResult> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| Error::External(format!("openai json error: {e}")))?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(Error::External(
            "openai completion returned empty text".to_string(),
        ));
    }

    Ok(CompletionResult {
        text,
        usage: parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    })
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResult> {
        tracing::debug!(
            model = %self.model,
            prompt_chars = req.user_prompt.chars().count(),
            "sending chat completion"
        );

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request_body(&self.model, &req))
            .send()
            .await
            .map_err(|e| Error::External(format!("openai request error: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::External(format!("openai read error: {e}")))?;

        if !status.is_success() {
            return Err(Error::External(format!(
                "openai completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        parse_body(&body)
    }
}
