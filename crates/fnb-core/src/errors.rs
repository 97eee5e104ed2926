use std::path::PathBuf;

/// How a failed delivery to one subscriber should be treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryFailureKind {
    /// Rate limits, network hiccups. The subscriber stays active and the next cycle retries.
    Transient,
    /// The recipient can no longer be reached (blocked the bot, deleted account, bad id).
    Permanent,
}

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the scheduler and
/// command surface can decide between "log and move on" and "tell the user".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ingestion error: {0}")]
    Ingestion(String),

    #[error("summarization failed after {attempts} attempt(s): {reason}")]
    SummarizationFailed { attempts: u32, reason: String },

    #[error("delivery failed ({kind:?}): {reason}")]
    Delivery {
        kind: DeliveryFailureKind,
        reason: String,
    },

    #[error("failed to persist subscriber store {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("scheduler busy: {0}")]
    Busy(String),

    #[error("scheduler stopped")]
    Stopped,

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn transient(reason: impl Into<String>) -> Self {
        Error::Delivery {
            kind: DeliveryFailureKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Error::Delivery {
            kind: DeliveryFailureKind::Permanent,
            reason: reason.into(),
        }
    }

    /// Delivery classification; anything that is not an explicit permanent failure is transient.
    pub fn delivery_kind(&self) -> DeliveryFailureKind {
        match self {
            Error::Delivery { kind, .. } => *kind,
            _ => DeliveryFailureKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
