use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a sent Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Opaque subscriber identity. For Telegram this is the user id rendered as a string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Direct-message chat for this subscriber, if the id is a Telegram user id.
    pub fn chat_id(&self) -> Option<ChatId> {
        self.0.trim().parse::<i64>().ok().map(ChatId)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for SubscriberId {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

/// One message captured from the monitored channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub source_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Messages collected since the previous drain, oldest first.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub messages: Vec<RawMessage>,
    /// Messages evicted by the per-cycle cap while this batch was collected.
    pub truncated: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
    #[default]
    Unknown,
}

impl Sentiment {
    /// Lenient parse of a model-provided label. Anything unrecognized is `Unknown`.
    pub fn parse_label(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "bullish" | "positive" => Sentiment::Bullish,
            "bearish" | "negative" => Sentiment::Bearish,
            "neutral" | "mixed" => Sentiment::Neutral,
            _ => Sentiment::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Sentiment::Bullish => "Bullish",
            Sentiment::Bearish => "Bearish",
            Sentiment::Neutral => "Neutral",
            Sentiment::Unknown => "Unknown",
        }
    }
}

/// Structured financial summary of one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub headline: String,
    pub bullets: Vec<String>,
    /// Tickers (upper-cased) and sectors.
    pub impacted: BTreeSet<String>,
    pub sentiment: Sentiment,
    pub generated_at: DateTime<Utc>,
    pub source_batch_size: usize,
}
