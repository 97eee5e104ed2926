//! Telegram adapter (teloxide).
//!
//! This crate implements the `fnb-core` MessagingPort over Telegram Bot API,
//! feeds channel posts into the ingest queue and routes user commands.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode, ApiError, RequestError};

use tokio::time::sleep;

pub mod monitor;
pub mod router;

use fnb_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::{DeliveryFailureKind, Error},
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: RequestError) -> Error {
        Error::Delivery {
            kind: classify(&e),
            reason: format!("telegram error: {e}"),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        tracing::debug!(wait = ?d, "telegram flood control, retrying once");
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

/// Errors meaning the recipient can no longer be reached; everything else
/// (flood control, network, server errors) is worth retrying next cycle.
pub fn classify(e: &RequestError) -> DeliveryFailureKind {
    match e {
        RequestError::Api(
            ApiError::BotBlocked
            | ApiError::UserDeactivated
            | ApiError::ChatNotFound
            | ApiError::CantInitiateConversation
            | ApiError::BotKicked,
        ) => DeliveryFailureKind::Permanent,
        _ => DeliveryFailureKind::Transient,
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: 4096,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}
