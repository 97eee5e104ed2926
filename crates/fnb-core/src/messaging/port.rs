use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Outbound messaging port used for summary delivery and command replies.
///
/// A failed send must be reported as `Error::Delivery` with a `Transient` or
/// `Permanent` kind; the broadcaster deactivates subscribers on permanent failures.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
}
