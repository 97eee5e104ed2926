//! Platform-neutral command handling (`/start`, `/stop`, `/status`, ...).
//!
//! Adapters parse inbound text into a [`Command`] and send back the returned
//! HTML reply; everything else lives here.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    domain::SubscriberId,
    formatting::escape_html,
    messaging::types::Command,
    scheduler::{CycleOutcome, CycleResult, Scheduler, SchedulerPhase},
    subscribers::{Profile, SubscribeChange, SubscriberStore, UnsubscribeChange},
    utils::{format_duration, format_time_ago},
    Error,
};

const NOT_SAVED_NOTE: &str =
    "\n\n⚠️ <i>Could not save this change; it applies until the bot restarts.</i>";

const HELP_TEXT: &str = "📈 <b>Financial News Bot - Commands</b>\n\n\
/start - Subscribe to financial news summaries\n\
/stop - Unsubscribe from updates\n\
/help - Show this help message\n\
/status - Show bot status and subscriber count\n\
/test - Subscribe yourself and run a summary now\n\
/subscribe_me - Subscribe yourself\n\
/force_update - Run a summary for all subscribers now\n\n\
This bot monitors a financial news channel and sends periodic summaries with potentially impacted stocks.";

pub struct CommandHandler {
    store: Arc<SubscriberStore>,
    scheduler: Scheduler,
    target_channel: String,
}

impl CommandHandler {
    pub fn new(store: Arc<SubscriberStore>, scheduler: Scheduler, target_channel: String) -> Self {
        Self {
            store,
            scheduler,
            target_channel,
        }
    }

    /// Handle one command and return the HTML reply for the sender's chat.
    pub async fn handle(&self, cmd: &Command) -> String {
        tracing::info!(
            command = %cmd.name,
            user_id = cmd.user_id.0,
            username = cmd.username.as_deref().unwrap_or(""),
            "command received"
        );

        match cmd.name.as_str() {
            "start" => self.subscribe(cmd, true).await,
            "subscribe_me" => self.subscribe(cmd, false).await,
            "stop" => self.unsubscribe(cmd).await,
            "help" => HELP_TEXT.to_string(),
            "status" => self.status().await,
            "force_update" => {
                let result = self.scheduler.trigger_now().await;
                cycle_reply(result)
            }
            "test" => {
                let note = match self.store.subscribe(&sender_id(cmd), profile(cmd)).await {
                    Err(Error::Persistence { .. }) => NOT_SAVED_NOTE,
                    _ => "",
                };
                let result = self.scheduler.trigger_now().await;
                format!("{}{note}", cycle_reply(result))
            }
            other => format!(
                "Unknown command /{}. Use /help to see what I can do.",
                escape_html(other)
            ),
        }
    }

    async fn subscribe(&self, cmd: &Command, full_welcome: bool) -> String {
        let name = escape_html(cmd.first_name.as_deref().unwrap_or("there"));
        let welcome = if full_welcome {
            format!(
                "👋 Welcome {name}! You're now subscribed to financial news summaries.\n\n\
                 Every summary contains:\n\
                 • A brief overview of the key points\n\
                 • Market sentiment\n\
                 • Potentially impacted stocks and sectors\n\n\
                 Use /help to see all commands, /stop to unsubscribe."
            )
        } else {
            format!("👋 Welcome {name}! You're now subscribed to financial news summaries.")
        };

        match self.store.subscribe(&sender_id(cmd), profile(cmd)).await {
            Ok(SubscribeChange::AlreadyActive) => {
                "You're already subscribed to financial news summaries.".to_string()
            }
            Ok(_) => welcome,
            Err(Error::Persistence { .. }) => format!("{welcome}{NOT_SAVED_NOTE}"),
            Err(e) => {
                tracing::error!(error = %e, "subscribe failed");
                "Sorry, something went wrong while subscribing. Please try again.".to_string()
            }
        }
    }

    async fn unsubscribe(&self, cmd: &Command) -> String {
        const BYE: &str = "You've been unsubscribed from financial news summaries. Use /start to subscribe again.";
        match self.store.unsubscribe(&sender_id(cmd)).await {
            Ok(UnsubscribeChange::Deactivated) => BYE.to_string(),
            Ok(UnsubscribeChange::AlreadyInactive | UnsubscribeChange::Unknown) => {
                "You're not subscribed. Use /start to subscribe.".to_string()
            }
            Err(Error::Persistence { .. }) => format!("{BYE}{NOT_SAVED_NOTE}"),
            Err(e) => {
                tracing::error!(error = %e, "unsubscribe failed");
                "Sorry, something went wrong while unsubscribing. Please try again.".to_string()
            }
        }
    }

    async fn status(&self) -> String {
        let counts = self.store.count().await;
        let status = self.scheduler.status().await;
        let now = Utc::now();

        let state = match status.phase {
            SchedulerPhase::Idle => "starting".to_string(),
            SchedulerPhase::Waiting { .. } => "waiting".to_string(),
            SchedulerPhase::Running { trigger } => format!("running ({trigger})"),
            SchedulerPhase::Stopped => "stopped".to_string(),
        };

        let mut out = format!(
            "🤖 <b>Bot Status</b>\n\
             • Subscribers: {} active / {} total\n\
             • Target channel: {}\n\
             • Interval: {}\n\
             • State: {state}",
            counts.active,
            counts.total,
            escape_html(&self.target_channel),
            format_duration(status.interval),
        );

        if let Some(next) = status.next_tick {
            let wait = (next - now).to_std().unwrap_or_default();
            out.push_str(&format!("\n• Next summary in: {}", format_duration(wait)));
        }

        match status.last_cycle {
            Some(last) => out.push_str(&format!(
                "\n• Last cycle: {} {}, {}",
                last.trigger,
                format_time_ago(last.finished_at, now),
                escape_html(&outcome_line(&last))
            )),
            None => out.push_str("\n• Last cycle: none yet"),
        }
        out
    }
}

/// Notice broadcast to subscribers at startup when enabled.
pub fn startup_notice_html(test_mode: bool) -> String {
    let mode = if test_mode {
        "TEST MODE (faster updates)"
    } else {
        "NORMAL MODE"
    };
    format!(
        "🤖 <b>Financial News Bot Started</b>\n\n\
         The bot has been started in {mode} and is now monitoring financial news.\n\
         You will receive regular summaries of financial news.\n\n\
         Use /help to see all commands, /stop to unsubscribe."
    )
}

fn sender_id(cmd: &Command) -> SubscriberId {
    SubscriberId::from(cmd.user_id.0)
}

fn profile(cmd: &Command) -> Profile {
    Profile {
        username: cmd.username.clone(),
        first_name: cmd.first_name.clone(),
    }
}

fn outcome_line(result: &CycleResult) -> String {
    match &result.outcome {
        CycleOutcome::Skipped => "no new messages".to_string(),
        CycleOutcome::Delivered => format!(
            "{} messages summarized, delivered to {}/{}",
            result.batch_size,
            result.delivered_count,
            result.delivered_count + result.failed_ids.len()
        ),
        CycleOutcome::SummarizationFailed(reason) => format!("summarization failed: {reason}"),
    }
}

fn cycle_reply(result: crate::Result<CycleResult>) -> String {
    match result {
        Ok(r) => match &r.outcome {
            CycleOutcome::Skipped => "No new messages to summarize since the last update.".to_string(),
            CycleOutcome::Delivered if r.failed_ids.is_empty() => format!(
                "✅ Summary of {} messages sent to {} subscriber(s).",
                r.batch_size, r.delivered_count
            ),
            CycleOutcome::Delivered => format!(
                "⚠️ Summary sent to {} subscriber(s); {} delivery failure(s). Check logs for details.",
                r.delivered_count,
                r.failed_ids.len()
            ),
            CycleOutcome::SummarizationFailed(_) => {
                "❌ Error generating summary. The messages were dropped; see logs.".to_string()
            }
        },
        Err(Error::Busy(_)) => "⏳ An update is already queued. Please try again shortly.".to_string(),
        Err(Error::Stopped) => "The bot is shutting down.".to_string(),
        Err(e) => {
            tracing::error!(error = %e, "manual cycle failed");
            "Sorry, the update could not be run.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::FixedOffset;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::buffer::MessageBuffer;
    use crate::domain::{ChatId, RawMessage, UserId};
    use crate::formatting::SummaryFormat;
    use crate::summarizer::testing::FakeCompletion;
    use crate::summarizer::{RetryPolicy, SummarizerAdapter, SummarizerSettings};
    use crate::testing::FakeMessenger;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<SubscriberStore>,
        buffer: Arc<MessageBuffer>,
        messenger: Arc<FakeMessenger>,
        scheduler: Scheduler,
        handler: CommandHandler,
    }

    fn harness() -> Harness {
        harness_with_store("subs.json")
    }

    fn harness_with_store(file: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SubscriberStore::open(dir.path().join(file)).unwrap());
        let buffer = Arc::new(MessageBuffer::new(200));
        let messenger = Arc::new(FakeMessenger::default());
        let summarizer = Arc::new(SummarizerAdapter::new(
            Arc::new(FakeCompletion::text(r#"{"summary":"Markets calm","key_points":["x"]}"#)),
            SummarizerSettings {
                timeout: Duration::from_secs(30),
                retry: RetryPolicy {
                    max_retries: 1,
                    initial_backoff: Duration::from_secs(2),
                },
                max_prompt_chars: 15_000,
                temperature: 0.2,
                max_tokens: 1000,
            },
        ));
        let broadcaster = Arc::new(Broadcaster::new(store.clone(), messenger.clone()));
        let scheduler = Scheduler::with_parts(
            buffer.clone(),
            summarizer,
            broadcaster,
            SummaryFormat {
                max_key_points: 3,
                offset: FixedOffset::east_opt(0).unwrap(),
                max_len: 4096,
            },
            Duration::from_secs(3600),
        );
        let handler = CommandHandler::new(store.clone(), scheduler.clone(), "marketfeed".into());
        Harness {
            _dir: dir,
            store,
            buffer,
            messenger,
            scheduler,
            handler,
        }
    }

    fn cmd(text: &str, user: i64) -> Command {
        Command::parse(
            text,
            ChatId(user),
            UserId(user),
            Some("alice".into()),
            Some("Alice".into()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_stop_start_keeps_one_active_record() {
        let h = harness();
        let first = h.handler.handle(&cmd("/start", 7)).await;
        assert!(first.contains("Welcome Alice"));
        let again = h.handler.handle(&cmd("/subscribe_me", 7)).await;
        assert!(again.contains("already subscribed"));

        let bye = h.handler.handle(&cmd("/stop", 7)).await;
        assert!(bye.contains("unsubscribed"));
        h.handler.handle(&cmd("/start", 7)).await;

        let counts = h.store.count().await;
        assert_eq!((counts.active, counts.total), (1, 1));
        let rec = h.store.get(&SubscriberId::from(7)).await.unwrap();
        assert_eq!(rec.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn stop_without_subscription() {
        let h = harness();
        let reply = h.handler.handle(&cmd("/stop", 9)).await;
        assert!(reply.contains("not subscribed"));
        assert_eq!(h.store.count().await.total, 0);
    }

    #[tokio::test]
    async fn status_reports_counts_and_channel() {
        let h = harness();
        h.handler.handle(&cmd("/start", 1)).await;
        h.handler.handle(&cmd("/start", 2)).await;
        h.handler.handle(&cmd("/stop", 2)).await;

        let reply = h.handler.handle(&cmd("/status", 1)).await;
        assert!(reply.contains("1 active / 2 total"));
        assert!(reply.contains("marketfeed"));
        assert!(reply.contains("1h 0m 0s"));
        assert!(reply.contains("none yet"));
    }

    #[tokio::test]
    async fn test_command_subscribes_and_runs_a_cycle() {
        let h = harness();
        let cancel = CancellationToken::new();
        let handle = h.scheduler.start(cancel.clone()).unwrap();
        h.buffer.append(RawMessage::new("1:1", "Fed holds rates"));

        let reply = h.handler.handle(&cmd("/test", 5)).await;

        assert!(reply.contains("Summary of 1 messages sent to 1"));
        assert_eq!(h.store.count().await.active, 1);
        let sent = h.messenger.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChatId(5));

        let status = h.handler.handle(&cmd("/status", 5)).await;
        assert!(status.contains("Last cycle: manual"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn force_update_with_nothing_new() {
        let h = harness();
        let cancel = CancellationToken::new();
        let handle = h.scheduler.start(cancel.clone()).unwrap();

        let reply = h.handler.handle(&cmd("/force_update", 5)).await;
        assert!(reply.contains("No new messages"));

        cancel.cancel();
        handle.await.unwrap();
        let reply = h.handler.handle(&cmd("/force_update", 5)).await;
        assert!(reply.contains("shutting down"));
    }

    #[tokio::test]
    async fn unknown_commands_point_to_help() {
        let h = harness();
        let reply = h.handler.handle(&cmd("/frobnicate", 1)).await;
        assert!(reply.contains("/help"));
        assert!(h.handler.handle(&cmd("/help", 1)).await.contains("/force_update"));
    }

    #[tokio::test]
    async fn unsaved_changes_are_flagged_to_the_user() {
        let h = harness_with_store("missing/subs.json");

        let welcome = h.handler.handle(&cmd("/start", 3)).await;
        assert!(welcome.contains("Welcome Alice"));
        assert!(welcome.ends_with(NOT_SAVED_NOTE));
        assert_eq!(h.store.count().await.active, 1);

        let bye = h.handler.handle(&cmd("/stop", 3)).await;
        assert!(bye.contains("unsubscribed"));
        assert!(bye.ends_with(NOT_SAVED_NOTE));
        assert_eq!(h.store.count().await.active, 0);
    }
}
