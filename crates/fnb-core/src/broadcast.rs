//! Fan-out of one formatted message to every active subscriber.

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    domain::SubscriberId,
    errors::DeliveryFailureKind,
    messaging::port::MessagingPort,
    subscribers::SubscriberStore,
    Error,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed_ids: BTreeSet<SubscriberId>,
    /// Subset of `failed_ids` marked inactive after a permanent failure.
    pub deactivated_ids: BTreeSet<SubscriberId>,
}

pub struct Broadcaster {
    store: Arc<SubscriberStore>,
    messenger: Arc<dyn MessagingPort>,
}

impl Broadcaster {
    pub fn new(store: Arc<SubscriberStore>, messenger: Arc<dyn MessagingPort>) -> Self {
        Self { store, messenger }
    }

    pub fn messenger(&self) -> &Arc<dyn MessagingPort> {
        &self.messenger
    }

    /// Deliver `html` to the active set as read once at the start.
    ///
    /// Every recipient is attempted regardless of earlier failures.
    pub async fn broadcast(&self, html: &str) -> BroadcastReport {
        let recipients = self.store.list_active().await;
        let mut report = BroadcastReport {
            attempted: recipients.len(),
            ..BroadcastReport::default()
        };

        if recipients.is_empty() {
            tracing::info!("no active subscribers to deliver to");
            return report;
        }

        for id in recipients {
            let res = match id.chat_id() {
                Some(chat) => self.messenger.send_html(chat, html).await.map(|_| ()),
                None => Err(Error::permanent(format!("not a chat id: {id}"))),
            };

            let err = match res {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::debug!(subscriber = %id, "summary delivered");
                    continue;
                }
                Err(e) => e,
            };

            match err.delivery_kind() {
                DeliveryFailureKind::Permanent => {
                    tracing::warn!(subscriber = %id, error = %err, "permanent delivery failure, deactivating");
                    if let Err(e) = self.store.unsubscribe(&id).await {
                        tracing::error!(subscriber = %id, error = %e, "failed to persist deactivation");
                    }
                    report.deactivated_ids.insert(id.clone());
                }
                DeliveryFailureKind::Transient => {
                    tracing::warn!(subscriber = %id, error = %err, "transient delivery failure, will retry next cycle");
                }
            }
            report.failed_ids.insert(id);
        }

        tracing::info!(
            delivered = report.delivered,
            attempted = report.attempted,
            failed = report.failed_ids.len(),
            deactivated = report.deactivated_ids.len(),
            "broadcast finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatId;
    use crate::subscribers::Profile;
    use crate::testing::FakeMessenger;

    async fn store_with(ids: &[i64]) -> (tempfile::TempDir, Arc<SubscriberStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SubscriberStore::open(dir.path().join("subs.json")).unwrap());
        for id in ids {
            store
                .subscribe(&SubscriberId::from(*id), Profile::default())
                .await
                .unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn permanent_failure_is_isolated_and_deactivates() {
        let (_dir, store) = store_with(&[1, 2, 3, 4, 5]).await;
        let messenger = Arc::new(FakeMessenger::default());
        messenger.fail_chat(3, DeliveryFailureKind::Permanent);

        let b = Broadcaster::new(store.clone(), messenger.clone());
        let report = b.broadcast("hello").await;

        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed_ids, BTreeSet::from([SubscriberId::from(3)]));
        assert_eq!(report.deactivated_ids, BTreeSet::from([SubscriberId::from(3)]));
        assert!(messenger.attempted().contains(&ChatId(4)));
        assert!(messenger.attempted().contains(&ChatId(5)));
        assert!(!store.list_active().await.contains(&SubscriberId::from(3)));
    }

    #[tokio::test]
    async fn transient_failure_keeps_subscriber_active() {
        let (_dir, store) = store_with(&[1, 2]).await;
        let messenger = Arc::new(FakeMessenger::default());
        messenger.fail_chat(1, DeliveryFailureKind::Transient);

        let report = Broadcaster::new(store.clone(), messenger)
            .broadcast("hello")
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed_ids.len(), 1);
        assert!(report.deactivated_ids.is_empty());
        assert_eq!(store.count().await.active, 2);
    }

    #[tokio::test]
    async fn non_numeric_ids_are_permanent_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SubscriberStore::open(dir.path().join("subs.json")).unwrap());
        store
            .subscribe(&SubscriberId::new("not-a-user"), Profile::default())
            .await
            .unwrap();

        let report = Broadcaster::new(store.clone(), Arc::new(FakeMessenger::default()))
            .broadcast("hello")
            .await;

        assert_eq!(report.delivered, 0);
        assert_eq!(report.deactivated_ids.len(), 1);
        assert_eq!(store.count().await.active, 0);
    }

    #[tokio::test]
    async fn unsaved_deactivation_does_not_stop_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SubscriberStore::open(dir.path().join("missing/subs.json")).unwrap());
        for id in [1, 2] {
            let res = store
                .subscribe(&SubscriberId::from(id), Profile::default())
                .await;
            assert!(matches!(res, Err(Error::Persistence { .. })));
        }
        let messenger = Arc::new(FakeMessenger::default());
        messenger.fail_chat(1, DeliveryFailureKind::Permanent);

        let report = Broadcaster::new(store.clone(), messenger.clone())
            .broadcast("hello")
            .await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.deactivated_ids, BTreeSet::from([SubscriberId::from(1)]));
        assert_eq!(messenger.sent()[0].0, ChatId(2));
        assert_eq!(
            store.list_active().await,
            BTreeSet::from([SubscriberId::from(2)])
        );
    }
}
