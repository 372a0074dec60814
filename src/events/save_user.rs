//! Deferred user creation through `save_user_queue`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{EventError, QueueEvent};
use crate::bus::{BusError, MessageBroker, MessageBrokerExt};
use crate::domain::User;
use crate::services::{create_in_transaction, UserService};
use crate::storage::UnitOfWorkFactory;

pub const SAVE_USER_QUEUE: &str = "save_user_queue";

/// Delay applied to every publish on [`SAVE_USER_QUEUE`].
pub const SAVE_USER_DELAY: Duration = Duration::ZERO;

/// Publishes users for deferred creation and creates them on delivery.
pub struct SaveUserEvent {
    broker: Arc<dyn MessageBroker>,
    uow_factory: Arc<dyn UnitOfWorkFactory>,
    service: Arc<dyn UserService>,
}

impl SaveUserEvent {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        uow_factory: Arc<dyn UnitOfWorkFactory>,
        service: Arc<dyn UserService>,
    ) -> Self {
        Self {
            broker,
            uow_factory,
            service,
        }
    }

    /// Queue a user for creation by a consumer.
    pub async fn publish(&self, user: &User) -> Result<(), BusError> {
        self.broker
            .publish_json(SAVE_USER_QUEUE, user, SAVE_USER_DELAY)
            .await?;
        info!(
            queue = SAVE_USER_QUEUE,
            user_uuid = ?user.uuid,
            email = %user.email,
            "User queued for creation"
        );
        Ok(())
    }
}

#[async_trait]
impl QueueEvent for SaveUserEvent {
    fn queue(&self) -> &str {
        SAVE_USER_QUEUE
    }

    async fn consume(&self, payload: &[u8]) -> Result<(), EventError> {
        let mut user = User::from_payload(payload).map_err(EventError::Decode)?;

        match create_in_transaction(self.uow_factory.as_ref(), self.service.as_ref(), &mut user)
            .await
        {
            Ok(()) => {
                info!(user_uuid = ?user.uuid, user_id = ?user.id, "User created from queue");
                Ok(())
            }
            // Redelivery of a record that is already stored.
            Err(e) if e.is_duplicate() => {
                warn!(user_uuid = ?user.uuid, "Duplicate delivery, user already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBroker;
    use crate::services::{DefaultUserService, ServiceError};
    use crate::storage::{MockStore, MockUnitOfWorkFactory};

    fn setup() -> (Arc<MockBroker>, Arc<MockStore>, SaveUserEvent) {
        let broker = Arc::new(MockBroker::new());
        let store = MockStore::new();
        let event = SaveUserEvent::new(
            broker.clone(),
            Arc::new(MockUnitOfWorkFactory::new(store.clone())),
            Arc::new(DefaultUserService::new()),
        );
        (broker, store, event)
    }

    #[tokio::test]
    async fn test_publish_targets_save_user_queue() {
        let (broker, _store, event) = setup();
        let mut user = User::new("a@x.io", "1");
        user.ensure_uuid();

        event.publish(&user).await.unwrap();

        let published = broker.take_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].queue, SAVE_USER_QUEUE);
        assert_eq!(published[0].delay, Duration::ZERO);
        assert_eq!(User::from_payload(&published[0].payload).unwrap(), user);
    }

    #[tokio::test]
    async fn test_publish_error_propagates() {
        let (broker, _store, event) = setup();
        broker.set_fail_on_publish(true).await;

        let err = event.publish(&User::new("a@x.io", "1")).await.unwrap_err();
        assert!(matches!(err, BusError::Publish { .. }));
    }

    #[tokio::test]
    async fn test_consume_commits() {
        let (_broker, store, event) = setup();
        let payload = br#"{"email":"a@x.io","phone_number":"1","addresses":[{"city":"X"}]}"#;

        event.consume(payload).await.unwrap();

        let committed = store.committed().await;
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].addresses.len(), 1);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_consume_malformed_payload_fails_fast() {
        let (_broker, store, event) = setup();

        let err = event.consume(b"{not json").await.unwrap_err();

        assert!(matches!(err, EventError::Decode(_)));
        assert_eq!(store.commits() + store.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_consume_failure_rolls_back() {
        let (_broker, store, event) = setup();
        store.fail_email("bad@x.io").await;

        let err = event
            .consume(br#"{"email":"bad@x.io"}"#)
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::Service(ServiceError::Storage(_))));
        assert_eq!(store.commits(), 0);
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_acknowledged() {
        let (_broker, store, event) = setup();
        let mut user = User::new("a@x.io", "1");
        user.ensure_uuid();
        let payload = user.to_payload().unwrap();

        event.consume(&payload).await.unwrap();
        event.consume(&payload).await.unwrap();

        assert_eq!(store.committed().await.len(), 1);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.rollbacks(), 1);
    }
}
