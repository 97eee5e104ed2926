use std::{env, path::PathBuf, time::Duration};

use chrono::FixedOffset;

use crate::{errors::Error, Result};

/// Typed configuration, read from the environment (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub monitor_bot_token: Option<String>,
    pub target_channel: String,

    // Completion provider
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,

    // Scheduling
    pub summary_interval: Duration,
    pub testing_interval: Duration,
    pub test_mode: bool,

    // Summarization policy
    pub summary_timeout: Duration,
    pub summary_max_retries: u32,
    pub summary_retry_backoff: Duration,
    pub max_messages_per_cycle: usize,
    pub max_prompt_chars: usize,
    pub max_key_points: usize,

    // Subscribers
    pub subscribers_file: PathBuf,
    pub admin_id: Option<String>,
    pub startup_notify: bool,

    // Presentation / plumbing
    pub display_offset: FixedOffset,
    pub ingest_queue_capacity: usize,
    pub log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Existing environment wins over `.env`.
        let _ = dotenvy::dotenv();

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
            })?;
        let openai_api_key = env_str("OPENAI_API_KEY").and_then(non_empty).ok_or_else(|| {
            Error::Config("OPENAI_API_KEY environment variable is required".to_string())
        })?;

        let monitor_bot_token = env_str("MONITOR_BOT_TOKEN").and_then(non_empty);
        let target_channel = env_str("TARGET_CHANNEL")
            .and_then(non_empty)
            .unwrap_or_else(|| "marketfeed".to_string());

        let openai_model = env_str("OPENAI_MODEL")
            .and_then(non_empty)
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let openai_base_url = env_str("OPENAI_BASE_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let summary_interval = minutes(env_u64("SUMMARY_INTERVAL_MINUTES").unwrap_or(240))?;
        let testing_interval = minutes(env_u64("TESTING_INTERVAL_MINUTES").unwrap_or(5))?;
        let test_mode = env_bool("TEST_MODE").unwrap_or(false);

        let summary_timeout = Duration::from_secs(env_u64("SUMMARY_TIMEOUT_SECS").unwrap_or(30));
        let summary_max_retries = env_u32("SUMMARY_MAX_RETRIES").unwrap_or(1).min(5);
        let summary_retry_backoff =
            Duration::from_millis(env_u64("SUMMARY_RETRY_BACKOFF_MS").unwrap_or(2_000));
        let max_messages_per_cycle = env_usize("MAX_MESSAGES_PER_CYCLE").unwrap_or(200).max(1);
        let max_prompt_chars = env_usize("MAX_PROMPT_CHARS").unwrap_or(15_000).max(500);
        let max_key_points = env_usize("MAX_KEY_POINTS").unwrap_or(3);

        let subscribers_file = subscribers_file_from_env();
        let admin_id = env_str("ADMIN_ID").and_then(non_empty);
        let startup_notify = env_bool("STARTUP_NOTIFY").unwrap_or(false);

        let offset_minutes = env_i64("DISPLAY_UTC_OFFSET_MINUTES").unwrap_or(480);
        let display_offset = parse_offset_minutes(offset_minutes)?;
        let ingest_queue_capacity = env_usize("INGEST_QUEUE_CAPACITY").unwrap_or(1024).max(1);
        let log_json = env_str("LOG_FORMAT")
            .map(|s| s.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            monitor_bot_token,
            target_channel,
            openai_api_key,
            openai_model,
            openai_base_url,
            summary_interval,
            testing_interval,
            test_mode,
            summary_timeout,
            summary_max_retries,
            summary_retry_backoff,
            max_messages_per_cycle,
            max_prompt_chars,
            max_key_points,
            subscribers_file,
            admin_id,
            startup_notify,
            display_offset,
            ingest_queue_capacity,
            log_json,
        })
    }

    /// The interval the scheduler actually waits between regular cycles.
    pub fn effective_interval(&self) -> Duration {
        if self.test_mode {
            self.testing_interval
        } else {
            self.summary_interval
        }
    }

    /// Command-line override; blank ids are ignored, padding is stripped like `ADMIN_ID`.
    pub fn set_admin_id(&mut self, id: &str) {
        if let Some(id) = non_empty(id.to_string()) {
            self.admin_id = Some(id);
        }
    }

    /// Token for the monitoring identity; falls back to the delivery bot.
    pub fn monitor_token(&self) -> &str {
        self.monitor_bot_token
            .as_deref()
            .unwrap_or(&self.telegram_bot_token)
    }
}

/// Store location without requiring the rest of the configuration (offline maintenance).
pub fn subscribers_file_from_env() -> PathBuf {
    let _ = dotenvy::dotenv();
    PathBuf::from(env_str("SUBSCRIBERS_FILE").unwrap_or_else(|| "subscribers.json".to_string()))
}

/// One year; keeps `Instant + interval` far from overflow.
const MAX_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

fn minutes(m: u64) -> Result<Duration> {
    if m == 0 {
        return Err(Error::Config(
            "summary intervals must be at least one minute".to_string(),
        ));
    }
    if m > MAX_INTERVAL_MINUTES {
        return Err(Error::Config(format!(
            "summary interval of {m} minutes exceeds the {MAX_INTERVAL_MINUTES} minute limit"
        )));
    }
    m.checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::Config(format!("summary interval of {m} minutes is too large")))
}

pub fn parse_offset_minutes(minutes: i64) -> Result<FixedOffset> {
    i32::try_from(minutes)
        .ok()
        .and_then(|m| m.checked_mul(60))
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| Error::Config(format!("invalid UTC offset: {minutes} minutes")))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        telegram_bot_token: "x".to_string(),
        monitor_bot_token: None,
        target_channel: "marketfeed".to_string(),
        openai_api_key: "k".to_string(),
        openai_model: "gpt-4o-mini".to_string(),
        openai_base_url: "http://localhost".to_string(),
        summary_interval: Duration::from_secs(4 * 3600),
        testing_interval: Duration::from_secs(300),
        test_mode: false,
        summary_timeout: Duration::from_secs(30),
        summary_max_retries: 1,
        summary_retry_backoff: Duration::from_secs(2),
        max_messages_per_cycle: 200,
        max_prompt_chars: 15_000,
        max_key_points: 3,
        subscribers_file: "/tmp/fnb-subscribers-test.json".into(),
        admin_id: None,
        startup_notify: false,
        display_offset: FixedOffset::east_opt(8 * 3600).unwrap(),
        ingest_queue_capacity: 16,
        log_json: false,
    }
}
