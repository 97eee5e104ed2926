//! Test doubles shared by the unit tests in this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    errors::DeliveryFailureKind,
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Error, Result,
};

/// Records every send; chats can be scripted to fail with a given kind.
#[derive(Default)]
pub(crate) struct FakeMessenger {
    next_id: Mutex<i32>,
    sends: Mutex<Vec<(ChatId, String)>>,
    attempts: Mutex<Vec<ChatId>>,
    failures: Mutex<HashMap<i64, DeliveryFailureKind>>,
}

impl FakeMessenger {
    pub(crate) fn fail_chat(&self, chat: i64, kind: DeliveryFailureKind) {
        self.failures.lock().unwrap().insert(chat, kind);
    }

    pub(crate) fn sent(&self) -> Vec<(ChatId, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub(crate) fn attempted(&self) -> Vec<ChatId> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: 4096,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.attempts.lock().unwrap().push(chat_id);
        if let Some(kind) = self.failures.lock().unwrap().get(&chat_id.0).copied() {
            return Err(Error::Delivery {
                kind,
                reason: format!("scripted failure for {}", chat_id.0),
            });
        }
        self.sends.lock().unwrap().push((chat_id, html.to_string()));
        let mut guard = self.next_id.lock().unwrap();
        *guard += 1;
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(*guard),
        })
    }
}
