use std::{future::Future, sync::Arc, time::Duration};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio_util::sync::CancellationToken;

use fnb_core::{
    commands::CommandHandler,
    domain::{ChatId, UserId},
    messaging::{port::MessagingPort, types::Command},
};

use crate::monitor::{handle_channel_post, ChannelMonitor};

const SHUTDOWN_RETRY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct AppState {
    pub commands: Arc<CommandHandler>,
    pub messenger: Arc<dyn MessagingPort>,
}

/// Poll the command bot until `cancel` fires. When `monitor` is given, the same
/// bot also receives channel posts (single-token setup).
pub async fn run_polling(
    bot: Bot,
    state: Arc<AppState>,
    monitor: Option<Arc<ChannelMonitor>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "command bot connected"),
        Err(e) => tracing::warn!(error = %e, "get_me failed for the command bot"),
    }

    let mut handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));
    let mut deps = dptree::deps![state];
    if let Some(monitor) = monitor {
        handler = handler.branch(Update::filter_channel_post().endpoint(handle_channel_post));
        deps.insert(monitor);
    }

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(deps)
        .default_handler(|_| async {})
        .build();
    let finished = stop_on_cancel(dispatcher.shutdown_token(), cancel, "command");
    dispatcher.dispatch().await;
    finished.cancel();

    tracing::info!("command polling stopped");
    Ok(())
}

/// Poll a separate monitoring bot that only feeds channel posts.
pub async fn run_monitor(
    bot: Bot,
    monitor: Arc<ChannelMonitor>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "monitor bot connected"),
        Err(e) => tracing::warn!(error = %e, "get_me failed for the monitor bot"),
    }

    let handler =
        dptree::entry().branch(Update::filter_channel_post().endpoint(handle_channel_post));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![monitor])
        .default_handler(|_| async {})
        .build();
    let finished = stop_on_cancel(dispatcher.shutdown_token(), cancel, "monitor");
    dispatcher.dispatch().await;
    finished.cancel();

    tracing::info!("monitor polling stopped");
    Ok(())
}

/// Spawn the task that stops a dispatcher once `cancel` fires. Returns the
/// token the caller cancels after `dispatch()` returns.
fn stop_on_cancel(
    token: teloxide::dispatching::ShutdownToken,
    cancel: CancellationToken,
    name: &'static str,
) -> CancellationToken {
    let finished = CancellationToken::new();
    tokio::spawn(shutdown_when_cancelled(
        move || {
            let token = token.clone();
            async move {
                match token.shutdown() {
                    Ok(done) => Ok(done.await),
                    Err(e) => Err(e),
                }
            }
        },
        cancel,
        finished.clone(),
        name,
    ));
    finished
}

/// Wait for `cancel`, then run `try_shutdown` until it succeeds. Shutdown
/// is refused while the dispatcher is still starting up, so refusals are
/// retried for as long as the dispatcher has not `finished`.
async fn shutdown_when_cancelled<F, E>(
    mut try_shutdown: impl FnMut() -> F,
    cancel: CancellationToken,
    finished: CancellationToken,
    name: &'static str,
) where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = finished.cancelled() => return,
    }
    loop {
        match try_shutdown().await {
            Ok(()) => return,
            Err(e) => {
                tracing::debug!(dispatcher = name, error = %e, "dispatcher not running yet");
                tokio::select! {
                    _ = tokio::time::sleep(SHUTDOWN_RETRY) => {}
                    _ = finished.cancelled() => return,
                }
            }
        }
    }
}

async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let (Some(user), Some(text)) = (msg.from(), msg.text()) else {
        return Ok(());
    };
    let chat_id = ChatId(msg.chat.id.0);

    let Some(cmd) = Command::parse(
        text,
        chat_id,
        UserId(user.id.0 as i64),
        user.username.clone(),
        Some(user.first_name.clone()),
    ) else {
        return Ok(());
    };

    let reply = state.commands.handle(&cmd).await;
    if let Err(e) = state.messenger.send_html(chat_id, &reply).await {
        tracing::warn!(chat_id = chat_id.0, command = %cmd.name, error = %e, "failed to send command reply");
    }
    Ok(())
}
