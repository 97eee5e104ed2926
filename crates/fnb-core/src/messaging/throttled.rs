use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

/// Spacing applied to summary fan-out.
#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Gap between consecutive sends to any recipient.
    pub global_min_interval: Duration,
    /// Gap between consecutive sends to one subscriber's chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        // Bot API flood limits: about 30 messages/s in total and 1/s per chat.
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Next free send slot on one lane (all chats, or a single chat).
#[derive(Debug)]
struct SendLane {
    gap: Duration,
    free_at: Instant,
}

impl SendLane {
    fn new(gap: Duration) -> Self {
        Self {
            gap,
            free_at: Instant::now(),
        }
    }

    /// Claim the earliest free slot; returns how long the caller must wait for it.
    fn claim(&mut self) -> Duration {
        let now = Instant::now();
        let slot = self.free_at.max(now);
        self.free_at = slot + self.gap;
        slot - now
    }
}

/// `MessagingPort` wrapper that spaces out sends.
///
/// A broadcast sends the same summary to every subscriber back to back; without
/// spacing a large subscriber list trips Telegram's flood control and deliveries
/// come back as transient failures.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    all_chats: Mutex<SendLane>,
    chats: Mutex<HashMap<i64, SendLane>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            all_chats: Mutex::new(SendLane::new(cfg.global_min_interval)),
            chats: Mutex::new(HashMap::new()),
        }
    }

    async fn wait_for_slot(&self, chat_id: i64) {
        let global = self.all_chats.lock().await.claim();
        let per_chat = self
            .chats
            .lock()
            .await
            .entry(chat_id)
            .or_insert_with(|| SendLane::new(self.cfg.per_chat_min_interval))
            .claim();

        let wait = global.max(per_chat);
        if !wait.is_zero() {
            tracing::trace!(chat_id, wait_ms = wait.as_millis() as u64, "throttling send");
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.wait_for_slot(chat_id.0).await;
        self.inner.send_html(chat_id, html).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMessenger;

    #[tokio::test(start_paused = true)]
    async fn spaces_sends_to_the_same_chat() {
        let fake = Arc::new(FakeMessenger::default());
        let throttled = ThrottledMessenger::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(10),
                per_chat_min_interval: Duration::from_secs(1),
            },
        );

        let start = Instant::now();
        throttled.send_html(ChatId(1), "a").await.unwrap();
        throttled.send_html(ChatId(1), "b").await.unwrap();
        throttled.send_html(ChatId(2), "c").await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(fake.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_chats_only_wait_for_the_global_gap() {
        let fake = Arc::new(FakeMessenger::default());
        let throttled = ThrottledMessenger::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(100),
                per_chat_min_interval: Duration::from_secs(1),
            },
        );

        let start = Instant::now();
        for chat in 1..=3 {
            throttled.send_html(ChatId(chat), "summary").await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(fake.attempted(), vec![ChatId(1), ChatId(2), ChatId(3)]);
    }
}
