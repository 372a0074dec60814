//! Ranked persist strategies: direct write, then queue publish.
//!
//! The backup file, the last tier, lives in `backup.rs`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use tracing::{info, warn};

use super::{ImportError, PersistStrategy, Tier};
use crate::bus::BusError;
use crate::domain::User;
use crate::events::SaveUserEvent;
use crate::services::{create_in_transaction, UserService};
use crate::storage::UnitOfWorkFactory;
use crate::utils::retry::fixed_backoff;

/// Create the user in its own transaction right away.
pub struct DirectWrite {
    uow_factory: Arc<dyn UnitOfWorkFactory>,
    service: Arc<dyn UserService>,
}

impl DirectWrite {
    pub fn new(uow_factory: Arc<dyn UnitOfWorkFactory>, service: Arc<dyn UserService>) -> Self {
        Self {
            uow_factory,
            service,
        }
    }
}

#[async_trait]
impl PersistStrategy for DirectWrite {
    fn tier(&self) -> Tier {
        Tier::DirectWrite
    }

    async fn persist(&self, user: &mut User) -> Result<(), ImportError> {
        create_in_transaction(self.uow_factory.as_ref(), self.service.as_ref(), user).await?;
        info!(user_uuid = ?user.uuid, user_id = ?user.id, "User committed");
        Ok(())
    }
}

/// Hand the user to the queue consumer, retrying at a fixed pace.
pub struct QueuePublish {
    event: Arc<SaveUserEvent>,
    attempts: usize,
    delay: Duration,
}

impl QueuePublish {
    /// `attempts` is the total number of publishes tried, at least one.
    pub fn new(event: Arc<SaveUserEvent>, attempts: usize, delay: Duration) -> Self {
        Self {
            event,
            attempts: attempts.max(1),
            delay,
        }
    }
}

#[async_trait]
impl PersistStrategy for QueuePublish {
    fn tier(&self) -> Tier {
        Tier::QueuePublish
    }

    async fn persist(&self, user: &mut User) -> Result<(), ImportError> {
        let user: &User = user;
        let event = self.event.as_ref();
        let attempts = self.attempts;

        (|| async move { event.publish(user).await })
            .retry(fixed_backoff(attempts, self.delay))
            .notify(|err: &BusError, delay: Duration| {
                warn!(
                    user_uuid = ?user.uuid,
                    error = %err,
                    delay = ?delay,
                    "Publish failed, retrying"
                );
            })
            .await
            .map_err(|source| ImportError::Exhausted { attempts, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBroker;
    use crate::services::DefaultUserService;
    use crate::storage::{MockStore, MockUnitOfWorkFactory};

    fn queue_tier(broker: &Arc<MockBroker>, attempts: usize) -> QueuePublish {
        let store = MockStore::new();
        let event = SaveUserEvent::new(
            broker.clone(),
            Arc::new(MockUnitOfWorkFactory::new(store)),
            Arc::new(DefaultUserService::new()),
        );
        QueuePublish::new(Arc::new(event), attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_direct_write_commits() {
        let store = MockStore::new();
        let tier = DirectWrite::new(
            Arc::new(MockUnitOfWorkFactory::new(store.clone())),
            Arc::new(DefaultUserService::new()),
        );

        let mut user = User::new("a@x.io", "1");
        tier.persist(&mut user).await.unwrap();

        assert_eq!(store.committed().await.len(), 1);
        assert!(user.id.is_some());
    }

    #[tokio::test]
    async fn test_direct_write_failure_is_reported() {
        let store = MockStore::new();
        store.set_fail_on_begin(true).await;
        let tier = DirectWrite::new(
            Arc::new(MockUnitOfWorkFactory::new(store)),
            Arc::new(DefaultUserService::new()),
        );

        let err = tier.persist(&mut User::new("a@x.io", "1")).await.unwrap_err();
        assert!(matches!(err, ImportError::Direct(_)));
    }

    #[tokio::test]
    async fn test_queue_publish_stops_at_first_success() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_next_publishes(1);
        let tier = queue_tier(&broker, 3);

        tier.persist(&mut User::new("a@x.io", "1")).await.unwrap();

        assert_eq!(broker.publish_attempts(), 2);
        assert_eq!(broker.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_queue_publish_gives_up_after_attempts() {
        let broker = Arc::new(MockBroker::new());
        broker.set_fail_on_publish(true).await;
        let tier = queue_tier(&broker, 3);

        let err = tier.persist(&mut User::new("a@x.io", "1")).await.unwrap_err();

        assert!(matches!(err, ImportError::Exhausted { attempts: 3, .. }));
        assert_eq!(broker.publish_attempts(), 3);
        assert_eq!(broker.published_count().await, 0);
    }
}
