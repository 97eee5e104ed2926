//! Channel monitor: turns posts of the target channel into `RawMessage`s.
//!
//! The monitoring bot must be an administrator of the channel to receive
//! `channel_post` updates.

use std::sync::Arc;

use teloxide::prelude::*;

use fnb_core::{domain::RawMessage, ingest::IngestSender};

/// Which chat counts as the target channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMatcher {
    Id(i64),
    Username(String),
}

impl ChannelMatcher {
    /// Accepts `-100123...`, `marketfeed`, `@marketfeed` or a `t.me/marketfeed` link.
    pub fn parse(target: &str) -> Self {
        let t = target.trim();
        if let Ok(id) = t.parse::<i64>() {
            return ChannelMatcher::Id(id);
        }
        let name = t
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("t.me/")
            .trim_start_matches('@')
            .trim_end_matches('/');
        ChannelMatcher::Username(name.to_lowercase())
    }

    pub fn matches(&self, chat_id: i64, username: Option<&str>) -> bool {
        match self {
            ChannelMatcher::Id(id) => *id == chat_id,
            ChannelMatcher::Username(want) => {
                username.is_some_and(|u| u.eq_ignore_ascii_case(want))
            }
        }
    }
}

pub struct ChannelMonitor {
    matcher: ChannelMatcher,
    ingest: IngestSender,
}

impl ChannelMonitor {
    pub fn new(target_channel: &str, ingest: IngestSender) -> Self {
        Self {
            matcher: ChannelMatcher::parse(target_channel),
            ingest,
        }
    }

    /// Build the message for a post, or `None` when it is from another chat or has no text.
    pub fn accept(
        &self,
        chat_id: i64,
        username: Option<&str>,
        message_id: i32,
        text: Option<&str>,
    ) -> Option<RawMessage> {
        if !self.matcher.matches(chat_id, username) {
            tracing::debug!(chat_id, "ignoring post from a non-target chat");
            return None;
        }
        let text = text.map(str::trim).filter(|t| !t.is_empty())?;
        Some(RawMessage::new(format!("{chat_id}:{message_id}"), text))
    }

    pub fn ingest(&self, msg: RawMessage) {
        let source_id = msg.source_id.clone();
        // Full or closed queue is logged by the sender; the post is dropped.
        if self.ingest.push(msg).is_ok() {
            tracing::debug!(%source_id, "channel post queued");
        }
    }
}

pub async fn handle_channel_post(msg: Message, monitor: Arc<ChannelMonitor>) -> ResponseResult<()> {
    let text = msg.text().or_else(|| msg.caption());
    if let Some(raw) = monitor.accept(msg.chat.id.0, msg.chat.username(), msg.id.0, text) {
        monitor.ingest(raw);
    }
    Ok(())
}
