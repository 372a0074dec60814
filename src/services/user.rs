//! User creation and lookup on top of a caller-owned unit of work.
//!
//! The service never begins, commits or rolls back; the caller owns the
//! transaction boundary and decides what a failure means.

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use crate::domain::User;
use crate::storage::{StorageError, UnitOfWork, UnitOfWorkFactory};

/// Errors returned by the user service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid user: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ServiceError {
    /// The record already exists under its external identifier.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ServiceError::Storage(StorageError::Conflict(_)))
    }
}

/// User operations executed inside an active unit of work.
#[async_trait]
pub trait UserService: Send + Sync {
    /// Insert the user row, then all address rows, in the same transaction.
    ///
    /// Assigns the external identifier if the record has none. On success the
    /// store-assigned id is written back into `user`.
    async fn create(&self, uow: &mut dyn UnitOfWork, user: &mut User) -> Result<(), ServiceError>;

    /// Load a user and their addresses by external identifier.
    async fn get_by_id(
        &self,
        uow: &mut dyn UnitOfWork,
        external_id: Uuid,
    ) -> Result<User, ServiceError>;
}

/// Default [`UserService`].
#[derive(Debug, Default, Clone)]
pub struct DefaultUserService;

impl DefaultUserService {
    pub fn new() -> Self {
        Self
    }

    fn validate(user: &User) -> Result<(), ServiceError> {
        if user.email.trim().is_empty() {
            return Err(ServiceError::Validation("email is required".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserService for DefaultUserService {
    async fn create(&self, uow: &mut dyn UnitOfWork, user: &mut User) -> Result<(), ServiceError> {
        Self::validate(user)?;
        let uuid = user.ensure_uuid();

        let id = uow.users()?.save(user).await?;
        if !user.addresses.is_empty() {
            uow.addresses()?.save(id, &user.addresses).await?;
        }

        user.id = Some(id);
        debug!(user_uuid = %uuid, user_id = id, addresses = user.addresses.len(), "User created");
        Ok(())
    }

    async fn get_by_id(
        &self,
        uow: &mut dyn UnitOfWork,
        external_id: Uuid,
    ) -> Result<User, ServiceError> {
        let mut user = uow.users()?.get_by_id(external_id).await?;
        if let Some(id) = user.id {
            user.addresses = uow.addresses()?.find_by_user(id).await?;
        }
        Ok(user)
    }
}

/// Create `user` in a fresh unit of work.
///
/// Commits on success and rolls back on any failure; exactly one of the two
/// happens once the transaction has begun. A rollback failure is logged and
/// the original error returned.
pub async fn create_in_transaction(
    factory: &dyn UnitOfWorkFactory,
    service: &dyn UserService,
    user: &mut User,
) -> Result<(), ServiceError> {
    let mut uow = factory.create();
    uow.begin().await?;

    match service.create(uow.as_mut(), user).await {
        Ok(()) => {
            if let Err(e) = uow.commit().await {
                // Nothing was stored, so the record must not carry the id.
                user.id = None;
                return Err(e.into());
            }
            Ok(())
        }
        Err(e) => {
            user.id = None;
            if let Err(rollback_err) = uow.rollback().await {
                error!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Address;
    use crate::storage::{MockStore, MockUnitOfWorkFactory, UnitOfWorkFactory};

    fn user_with_address(email: &str) -> User {
        let mut user = User::new(email, "555-0100");
        user.addresses.push(Address {
            street: Some("1 Main St".to_string()),
            ..Default::default()
        });
        user
    }

    #[tokio::test]
    async fn test_create_assigns_ids() {
        let store = MockStore::new();
        let factory = MockUnitOfWorkFactory::new(store.clone());
        let service = DefaultUserService::new();

        let mut uow = factory.create();
        uow.begin().await.unwrap();
        let mut user = user_with_address("a@x.io");
        service.create(uow.as_mut(), &mut user).await.unwrap();
        uow.commit().await.unwrap();

        assert!(user.id.is_some());
        assert!(user.uuid.is_some());
        assert_eq!(store.committed().await[0].addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_create_keeps_existing_uuid() {
        let store = MockStore::new();
        let factory = MockUnitOfWorkFactory::new(store);
        let service = DefaultUserService::new();

        let mut user = user_with_address("a@x.io");
        let uuid = user.ensure_uuid();

        let mut uow = factory.create();
        uow.begin().await.unwrap();
        service.create(uow.as_mut(), &mut user).await.unwrap();
        assert_eq!(user.uuid, Some(uuid));
    }

    #[tokio::test]
    async fn test_create_rejects_empty_email() {
        let store = MockStore::new();
        let factory = MockUnitOfWorkFactory::new(store);
        let service = DefaultUserService::new();

        let mut uow = factory.create();
        uow.begin().await.unwrap();
        let mut user = User::new("  ", "1");
        let err = service.create(uow.as_mut(), &mut user).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(user.id.is_none());
    }

    #[tokio::test]
    async fn test_create_without_transaction_fails() {
        let store = MockStore::new();
        let factory = MockUnitOfWorkFactory::new(store);
        let service = DefaultUserService::new();

        let mut uow = factory.create();
        let mut user = user_with_address("a@x.io");
        let err = service.create(uow.as_mut(), &mut user).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Storage(StorageError::TransactionNotActive)
        ));
    }

    #[tokio::test]
    async fn test_get_by_id_loads_addresses() {
        let store = MockStore::new();
        let factory = MockUnitOfWorkFactory::new(store);
        let service = DefaultUserService::new();

        let mut user = user_with_address("a@x.io");
        let mut uow = factory.create();
        uow.begin().await.unwrap();
        service.create(uow.as_mut(), &mut user).await.unwrap();
        uow.commit().await.unwrap();

        let mut read = factory.create();
        read.begin().await.unwrap();
        let loaded = service
            .get_by_id(read.as_mut(), user.uuid.unwrap())
            .await
            .unwrap();
        assert_eq!(loaded, user);
    }

    #[tokio::test]
    async fn test_get_by_id_not_found() {
        let store = MockStore::new();
        let factory = MockUnitOfWorkFactory::new(store);
        let service = DefaultUserService::new();

        let mut uow = factory.create();
        uow.begin().await.unwrap();
        let missing = Uuid::new_v4();
        let err = service.get_by_id(uow.as_mut(), missing).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Storage(StorageError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_create_in_transaction_commits() {
        let store = MockStore::new();
        let factory = MockUnitOfWorkFactory::new(store.clone());

        let mut user = user_with_address("a@x.io");
        create_in_transaction(&factory, &DefaultUserService::new(), &mut user)
            .await
            .unwrap();

        assert_eq!(store.commits(), 1);
        assert_eq!(store.rollbacks(), 0);
        assert!(user.id.is_some());
    }

    #[tokio::test]
    async fn test_create_in_transaction_rolls_back_partial_write() {
        let store = MockStore::new();
        store.set_fail_on_address(true).await;
        let factory = MockUnitOfWorkFactory::new(store.clone());

        let mut user = user_with_address("a@x.io");
        let err = create_in_transaction(&factory, &DefaultUserService::new(), &mut user)
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Storage(StorageError::Constraint(_))));
        assert_eq!(store.commits(), 0);
        assert_eq!(store.rollbacks(), 1);
        assert!(store.committed().await.is_empty());
        assert!(user.id.is_none());
    }

    #[tokio::test]
    async fn test_create_in_transaction_commit_failure_clears_id() {
        let store = MockStore::new();
        store.set_fail_on_commit(true).await;
        let factory = MockUnitOfWorkFactory::new(store.clone());

        let mut user = user_with_address("a@x.io");
        let result = create_in_transaction(&factory, &DefaultUserService::new(), &mut user).await;

        assert!(result.is_err());
        assert!(user.id.is_none());
        assert_eq!(store.commits(), 0);
        assert_eq!(store.rollbacks(), 1);
    }

    #[test]
    fn test_is_duplicate() {
        assert!(ServiceError::Storage(StorageError::Conflict("x".into())).is_duplicate());
        assert!(!ServiceError::Validation("x".into()).is_duplicate());
    }
}
