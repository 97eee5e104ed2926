use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use teloxide::Bot;
use tokio_util::sync::CancellationToken;

use fnb_core::{
    broadcast::Broadcaster,
    buffer::MessageBuffer,
    commands::{startup_notice_html, CommandHandler},
    config::{self, Config},
    domain::SubscriberId,
    ingest,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    scheduler::{CycleTrigger, Scheduler},
    subscribers::{Profile, SubscriberStore, UnsubscribeChange},
    summarizer::{SummarizerAdapter, SummarizerSettings},
};
use fnb_openai::OpenAiClient;
use fnb_telegram::{
    monitor::ChannelMonitor,
    router::{self, AppState},
    TelegramMessenger,
};

/// Financial news brief bot: summarizes a Telegram channel for its subscribers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use the short testing interval (overrides TEST_MODE)
    #[arg(long, default_value_t = false)]
    test_mode: bool,

    /// Subscribe this user id at startup (overrides ADMIN_ID)
    #[arg(long)]
    admin_id: Option<String>,

    /// Run one summary cycle right after startup
    #[arg(long, default_value_t = false)]
    run_now: bool,

    /// Debug logging for the bot's own crates
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Subscriber store location (overrides SUBSCRIBERS_FILE)
    #[arg(long)]
    subscribers_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Inspect or edit the subscriber store without starting the bot
    Subscribers {
        #[command(subcommand)]
        action: SubscribersAction,
    },
}

#[derive(Subcommand, Debug)]
enum SubscribersAction {
    /// Print every record
    List,
    /// Subscribe (or reactivate) an id
    Add {
        id: String,
        #[arg(long)]
        username: Option<String>,
    },
    /// Mark an id inactive
    Remove { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Cmd::Subscribers { action }) = args.command {
        fnb_core::logging::init("fnb", args.debug, false)?;
        let path = args
            .subscribers_file
            .unwrap_or_else(config::subscribers_file_from_env);
        return manage_subscribers(path, action).await;
    }

    let mut cfg = Config::load().context("loading configuration")?;
    cfg.test_mode |= args.test_mode;
    if let Some(id) = args.admin_id.as_deref() {
        cfg.set_admin_id(id);
    }
    if let Some(path) = args.subscribers_file {
        cfg.subscribers_file = path;
    }
    fnb_core::logging::init("fnb", args.debug, cfg.log_json)?;

    run(Arc::new(cfg), args.run_now).await
}

async fn run(cfg: Arc<Config>, run_now: bool) -> anyhow::Result<()> {
    tracing::info!(
        channel = %cfg.target_channel,
        interval_secs = cfg.effective_interval().as_secs(),
        test_mode = cfg.test_mode,
        model = %cfg.openai_model,
        "starting financial news bot"
    );

    let store = Arc::new(
        SubscriberStore::open(&cfg.subscribers_file).context("opening subscriber store")?,
    );
    if let Some(admin) = &cfg.admin_id {
        match store.subscribe(&SubscriberId::new(admin.as_str()), Profile::default()).await {
            Ok(change) => tracing::info!(admin = %admin, ?change, "admin subscribed"),
            Err(e) => tracing::warn!(admin = %admin, error = %e, "admin subscription not saved"),
        }
    }

    let bot = Bot::new(cfg.telegram_bot_token.clone());

    // Throttling keeps broadcast bursts under Telegram's flood limits; the adapter
    // still retries a single RetryAfter on its own.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let completion = Arc::new(OpenAiClient::new(
        cfg.openai_api_key.clone(),
        cfg.openai_model.clone(),
        cfg.openai_base_url.clone(),
    )?);
    let summarizer = Arc::new(SummarizerAdapter::new(
        completion,
        SummarizerSettings::from_config(&cfg),
    ));
    let buffer = Arc::new(MessageBuffer::new(cfg.max_messages_per_cycle));
    let broadcaster = Arc::new(Broadcaster::new(store.clone(), messenger.clone()));
    let scheduler = Scheduler::new(&cfg, buffer.clone(), summarizer, broadcaster.clone());

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let (ingest_tx, ingest_rx) = ingest::channel(cfg.ingest_queue_capacity);
    let pump = ingest::spawn_pump(ingest_rx, buffer, cancel.clone());
    let scheduler_task = scheduler.start(cancel.clone())?;
    let monitor = Arc::new(ChannelMonitor::new(&cfg.target_channel, ingest_tx));

    if cfg.startup_notify {
        let report = broadcaster
            .broadcast(&startup_notice_html(cfg.test_mode))
            .await;
        tracing::info!(delivered = report.delivered, "startup notice sent");
    }

    if run_now {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            match scheduler.trigger(CycleTrigger::Startup).await {
                Ok(result) => tracing::info!(outcome = ?result.outcome, "startup cycle finished"),
                Err(e) => tracing::warn!(error = %e, "startup cycle did not run"),
            }
        });
    }

    let state = Arc::new(AppState {
        commands: Arc::new(CommandHandler::new(
            store,
            scheduler,
            cfg.target_channel.clone(),
        )),
        messenger,
    });

    let polling = match &cfg.monitor_bot_token {
        Some(token) => {
            let monitor_task = tokio::spawn(router::run_monitor(
                Bot::new(token.clone()),
                monitor,
                cancel.clone(),
            ));
            let res = router::run_polling(bot, state, None, cancel.clone()).await;
            cancel.cancel();
            if let Ok(Err(e)) = monitor_task.await {
                tracing::error!(error = %e, "monitor bot failed");
            }
            res
        }
        None => router::run_polling(bot, state, Some(monitor), cancel.clone()).await,
    };

    // Polling only ends on shutdown or a fatal error; either way stop everything.
    cancel.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "scheduler task panicked");
    }
    if let Err(e) = pump.await {
        tracing::error!(error = %e, "ingest pump panicked");
    }
    tracing::info!("shutdown complete");
    polling
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn manage_subscribers(path: PathBuf, action: SubscribersAction) -> anyhow::Result<()> {
    let store = SubscriberStore::open(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    match action {
        SubscribersAction::List => {
            let all = store.all().await;
            let counts = store.count().await;
            println!(
                "{}: {} subscribers ({} active)",
                path.display(),
                counts.total,
                counts.active
            );
            for (id, rec) in all {
                println!(
                    "{:<16} {:<8} since {}  @{}  {}",
                    id.to_string(),
                    if rec.active { "active" } else { "inactive" },
                    rec.subscribed_at.format("%Y-%m-%d %H:%M:%S"),
                    rec.username.as_deref().unwrap_or("-"),
                    rec.first_name.as_deref().unwrap_or(""),
                );
            }
        }
        SubscribersAction::Add { id, username } => {
            let change = store
                .subscribe(
                    &SubscriberId::new(id.as_str()),
                    Profile {
                        username,
                        first_name: None,
                    },
                )
                .await?;
            println!("{id}: {change:?}");
        }
        SubscribersAction::Remove { id } => {
            let change = store.unsubscribe(&SubscriberId::new(id.as_str())).await?;
            if change == UnsubscribeChange::Unknown {
                println!("{id}: no such subscriber");
            } else {
                println!("{id}: {change:?}");
            }
        }
    }
    Ok(())
}
