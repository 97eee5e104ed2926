use serde::{Deserialize, Serialize};

/// The completion backend in use (reported in logs and `/status`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Local,
}

impl ProviderKind {
    pub fn label(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Local => "local",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Normalized request for a single chat completion.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider to constrain output to a JSON object when it supports it.
    pub json_response: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CompletionResult {
    pub text: String,
    pub usage: Option<TokenUsage>,
}
