//! Bounded hand-off between the channel monitor and the message buffer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{AppendOutcome, MessageBuffer},
    domain::RawMessage,
    Error, Result,
};

/// Producer side handed to the monitoring collaborator.
#[derive(Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<RawMessage>,
}

impl IngestSender {
    /// Enqueue without waiting. A full or closed queue drops the message; the next
    /// post arrives naturally, so there is no retry.
    pub fn push(&self, msg: RawMessage) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| {
            let err = match e {
                mpsc::error::TrySendError::Full(m) => {
                    Error::Ingestion(format!("ingest queue full, dropped {}", m.source_id))
                }
                mpsc::error::TrySendError::Closed(m) => {
                    Error::Ingestion(format!("ingest queue closed, dropped {}", m.source_id))
                }
            };
            tracing::warn!(error = %err, "channel message dropped");
            err
        })
    }
}

pub fn channel(capacity: usize) -> (IngestSender, mpsc::Receiver<RawMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngestSender { tx }, rx)
}

/// Move queued messages into the buffer until cancelled or every sender is gone.
pub fn spawn_pump(
    mut rx: mpsc::Receiver<RawMessage>,
    buffer: Arc<MessageBuffer>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        tracing::info!("ingest queue closed");
                        break;
                    };
                    let source_id = msg.source_id.clone();
                    match buffer.append(msg) {
                        AppendOutcome::Duplicate => {}
                        outcome => tracing::debug!(
                            %source_id,
                            ?outcome,
                            buffered = buffer.len(),
                            "buffered channel message"
                        ),
                    }
                }
            }
        }
    })
}
