//! Summarizer adapter: prompt building, bounded/retried completion calls and
//! lenient parsing of the model's structured answer.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use crate::{
    config::Config,
    domain::{Batch, Sentiment, Summary},
    model::{client::CompletionClient, types::CompletionRequest},
    utils::truncate_chars,
    Error,
};

const MESSAGE_SEPARATOR: &str = "\n\n---\n\n";
const TRUNCATION_MARKER: &str = "...(truncated)";
const MAX_FALLBACK_HEADLINE_CHARS: usize = 1_500;

const SYSTEM_PROMPT: &str = "You are a financial analyst assistant. Summarize the following financial news updates \
and identify potentially impacted stocks or market sectors.

Format your response as a valid JSON object with exactly this structure:
{
    \"headline\": \"Brief 2-3 sentence summary of key points\",
    \"key_points\": [\"Point 1\", \"Point 2\", \"Point 3\"],
    \"potentially_impacted_stocks\": [\"TICKER1\", \"TICKER2\"],
    \"market_sectors\": [\"Sector1\", \"Sector2\"],
    \"sentiment\": \"bullish\" | \"bearish\" | \"neutral\"
}
Make sure your response can be parsed as valid JSON.";

/// Result of one summarization attempt sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SummaryOutcome {
    /// Empty batch; the service was not called.
    NoActivity,
    /// The model returned the requested structure.
    Parsed(Summary),
    /// The model answered but not in the requested structure. The raw text is the headline.
    Fallback(Summary),
    /// Transport/timeout failures exhausted the retry budget.
    Failed(String),
}

impl SummaryOutcome {
    pub fn summary(&self) -> Option<&Summary> {
        match self {
            SummaryOutcome::Parsed(s) | SummaryOutcome::Fallback(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Wait before the first retry; doubles for each following retry.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SummarizerSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_prompt_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl SummarizerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: cfg.summary_timeout,
            retry: RetryPolicy {
                max_retries: cfg.summary_max_retries,
                initial_backoff: cfg.summary_retry_backoff,
            },
            max_prompt_chars: cfg.max_prompt_chars,
            ..Self::default()
        }
    }
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_prompt_chars: 15_000,
            temperature: 0.2,
            max_tokens: 1_000,
        }
    }
}

pub struct SummarizerAdapter {
    client: Arc<dyn CompletionClient>,
    settings: SummarizerSettings,
}

impl SummarizerAdapter {
    pub fn new(client: Arc<dyn CompletionClient>, settings: SummarizerSettings) -> Self {
        Self { client, settings }
    }

    pub async fn summarize(&self, batch: &Batch) -> SummaryOutcome {
        if batch.is_empty() {
            return SummaryOutcome::NoActivity;
        }

        let req = build_request(batch, &self.settings);
        let attempts = self.settings.retry.max_retries + 1;
        let mut last_err = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let wait = self.settings.retry.backoff_for(attempt - 1);
                tracing::info!(attempt, wait_ms = wait.as_millis() as u64, "retrying summarization");
                tokio::time::sleep(wait).await;
            }

            let res = tokio::time::timeout(self.settings.timeout, self.client.complete(req.clone()))
                .await;

            match res {
                Ok(Ok(out)) => {
                    if let Some(u) = out.usage.as_ref() {
                        tracing::debug!(
                            provider = self.client.provider().label(),
                            input_tokens = u.input_tokens,
                            output_tokens = u.output_tokens,
                            "completion usage"
                        );
                    }
                    return parse_response(&out.text, batch.len());
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "summarization attempt failed");
                    last_err = e.to_string();
                }
                Err(_) => {
                    tracing::warn!(
                        attempt,
                        timeout_secs = self.settings.timeout.as_secs(),
                        "summarization attempt timed out"
                    );
                    last_err = format!("timed out after {:?}", self.settings.timeout);
                }
            }
        }

        let err = Error::SummarizationFailed {
            attempts,
            reason: last_err,
        };
        tracing::error!(error = %err, batch = batch.len(), "giving up on this batch");
        SummaryOutcome::Failed(err.to_string())
    }
}

/// Deterministic prompt: same batch, same request.
pub fn build_request(batch: &Batch, settings: &SummarizerSettings) -> CompletionRequest {
    let combined = batch
        .messages
        .iter()
        .map(|m| m.text.trim())
        .collect::<Vec<_>>()
        .join(MESSAGE_SEPARATOR);

    let combined = if combined.chars().count() > settings.max_prompt_chars {
        tracing::warn!(
            max_chars = settings.max_prompt_chars,
            "message text truncated to fit the prompt budget"
        );
        format!(
            "{}{TRUNCATION_MARKER}",
            truncate_chars(&combined, settings.max_prompt_chars)
        )
    } else {
        combined
    };

    CompletionRequest {
        system_prompt: SYSTEM_PROMPT.to_string(),
        user_prompt: format!("News updates to analyze:\n{combined}"),
        temperature: settings.temperature,
        max_tokens: settings.max_tokens,
        json_response: true,
    }
}

/// Parse a model answer into `Parsed`, or fall back to the raw text.
pub fn parse_response(raw: &str, batch_size: usize) -> SummaryOutcome {
    match parse_structured(raw, batch_size) {
        Some(summary) => SummaryOutcome::Parsed(summary),
        None => {
            tracing::warn!("model output is not in the requested structure, using raw text");
            SummaryOutcome::Fallback(fallback_summary(raw, batch_size))
        }
    }
}

fn fallback_summary(raw: &str, batch_size: usize) -> Summary {
    let text = raw.trim();
    let headline = if text.chars().count() > MAX_FALLBACK_HEADLINE_CHARS {
        format!("{}...", truncate_chars(text, MAX_FALLBACK_HEADLINE_CHARS))
    } else {
        text.to_string()
    };
    Summary {
        headline,
        bullets: Vec::new(),
        impacted: BTreeSet::new(),
        sentiment: Sentiment::Unknown,
        generated_at: Utc::now(),
        source_batch_size: batch_size,
    }
}

fn parse_structured(raw: &str, batch_size: usize) -> Option<Summary> {
    let v = extract_json_object(raw)?;

    let headline = ["headline", "summary"]
        .iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    let bullets = ["key_points", "bullets"]
        .iter()
        .find_map(|k| v.get(*k))
        .map(string_list)
        .unwrap_or_default();

    // Impact and sentiment are best-effort: bad shapes degrade to empty/unknown.
    let mut impacted = BTreeSet::new();
    if let Some(stocks) = v.get("potentially_impacted_stocks") {
        for t in string_list(stocks) {
            impacted.insert(t.trim_start_matches('$').to_uppercase());
        }
    }
    if let Some(sectors) = v.get("market_sectors") {
        impacted.extend(string_list(sectors));
    }

    let sentiment = ["sentiment", "market_sentiment"]
        .iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(Sentiment::parse_label)
        .unwrap_or_default();

    Some(Summary {
        headline,
        bullets,
        impacted,
        sentiment,
        generated_at: Utc::now(),
        source_batch_size: batch_size,
    })
}

/// Accept a bare object, a fenced ```json block, or the outermost `{...}` span.
fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex");
    if let Some(c) = fence.captures(trimmed) {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&c[1]) {
            return Some(v);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

fn string_list(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::model::types::{CompletionResult, ProviderKind};
    use crate::Result;

    use super::*;

    pub(crate) enum Reply {
        Text(String),
        Fail(String),
        Hang,
    }

    /// Scripted completion client; replies are consumed in order, the last one repeats.
    pub(crate) struct FakeCompletion {
        replies: Mutex<Vec<Reply>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<CompletionRequest>>,
    }

    impl FakeCompletion {
        pub(crate) fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn text(s: &str) -> Self {
            Self::new(vec![Reply::Text(s.to_string())])
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn prompts(&self) -> Vec<CompletionRequest> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionClient for FakeCompletion {
        fn provider(&self) -> ProviderKind {
            ProviderKind::Local
        }

        async fn complete(&self, req: CompletionRequest) -> Result<CompletionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(req);
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.len() > 1 {
                    Some(replies.remove(0))
                } else {
                    match replies.first() {
                        Some(Reply::Text(s)) => Some(Reply::Text(s.clone())),
                        Some(Reply::Fail(s)) => Some(Reply::Fail(s.clone())),
                        Some(Reply::Hang) | None => None,
                    }
                }
            };
            match reply {
                Some(Reply::Text(text)) => Ok(CompletionResult { text, usage: None }),
                Some(Reply::Fail(e)) => Err(Error::External(e)),
                Some(Reply::Hang) | None => std::future::pending().await,
            }
        }
    }
}
