//! In-memory storage for testing.
//!
//! Writes are staged per unit of work and only become visible in the store
//! on commit, so rollback and atomicity behave like a real database.
//! Failures can be injected per email address or per phase.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AddressRepository, Result, StorageError, TxSlot, UnitOfWork, UnitOfWorkFactory,
    UnitOfWorkState, UserRepository,
};
use crate::domain::{Address, User};

/// Mock store that keeps committed users in memory.
#[derive(Default)]
pub struct MockStore {
    users: RwLock<Vec<User>>,
    next_id: AtomicI64,
    fail_emails: RwLock<HashSet<String>>,
    fail_on_begin: RwLock<bool>,
    fail_on_commit: RwLock<bool>,
    fail_on_address: RwLock<bool>,
    write_delay: RwLock<Duration>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the user insert for this email.
    pub async fn fail_email(&self, email: impl Into<String>) {
        self.fail_emails.write().await.insert(email.into());
    }

    pub async fn set_fail_on_begin(&self, fail: bool) {
        *self.fail_on_begin.write().await = fail;
    }

    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.fail_on_commit.write().await = fail;
    }

    pub async fn set_fail_on_address(&self, fail: bool) {
        *self.fail_on_address.write().await = fail;
    }

    /// Sleep this long inside every user insert.
    pub async fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.write().await = delay;
    }

    pub async fn committed(&self) -> Vec<User> {
        self.users.read().await.clone()
    }

    pub async fn committed_emails(&self) -> HashSet<String> {
        self.users
            .read()
            .await
            .iter()
            .map(|u| u.email.clone())
            .collect()
    }

    /// Highest number of simultaneously open transactions seen.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Writes staged by one mock transaction.
#[derive(Default)]
pub struct MockTx {
    staged: Vec<User>,
}

/// Factory producing units of work over a shared [`MockStore`].
#[derive(Clone)]
pub struct MockUnitOfWorkFactory {
    store: Arc<MockStore>,
}

impl MockUnitOfWorkFactory {
    pub fn new(store: Arc<MockStore>) -> Self {
        Self { store }
    }
}

impl UnitOfWorkFactory for MockUnitOfWorkFactory {
    fn create(&self) -> Box<dyn UnitOfWork> {
        Box::new(MockUnitOfWork::new(Arc::clone(&self.store)))
    }
}

/// Mock unit of work.
pub struct MockUnitOfWork {
    store: Arc<MockStore>,
    slot: TxSlot<MockTx>,
}

impl MockUnitOfWork {
    pub fn new(store: Arc<MockStore>) -> Self {
        Self {
            store,
            slot: TxSlot::new(),
        }
    }
}

impl Drop for MockUnitOfWork {
    fn drop(&mut self) {
        // Dropping an open transaction discards it.
        if self.slot.state() == UnitOfWorkState::Active {
            self.store.leave();
            self.store.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl UnitOfWork for MockUnitOfWork {
    async fn begin(&mut self) -> Result<()> {
        self.slot.ensure_startable()?;
        if *self.store.fail_on_begin.read().await {
            return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
        }
        self.slot.start(MockTx::default())?;
        self.store.enter();
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.slot.finish(UnitOfWorkState::Committed)?;
        self.store.leave();

        if *self.store.fail_on_commit.read().await {
            self.slot.mark_rolled_back();
            self.store.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Database(sqlx::Error::Protocol(
                "mock commit failure".to_string(),
            )));
        }

        let mut users = self.store.users.write().await;
        for staged in &tx.staged {
            if users.iter().any(|u| u.uuid == staged.uuid) {
                drop(users);
                self.slot.mark_rolled_back();
                self.store.rollbacks.fetch_add(1, Ordering::SeqCst);
                return Err(StorageError::Conflict(format!(
                    "users.uuid {:?} already exists",
                    staged.uuid
                )));
            }
        }
        users.extend(tx.staged);
        self.store.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.slot.finish(UnitOfWorkState::RolledBack)?;
        self.store.leave();
        self.store.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn users(&mut self) -> Result<Box<dyn UserRepository + '_>> {
        let store: &MockStore = &self.store;
        let tx = self.slot.active_mut()?;
        Ok(Box::new(MockUserRepository { store, tx }))
    }

    fn addresses(&mut self) -> Result<Box<dyn AddressRepository + '_>> {
        let store: &MockStore = &self.store;
        let tx = self.slot.active_mut()?;
        Ok(Box::new(MockAddressRepository { store, tx }))
    }

    fn state(&self) -> UnitOfWorkState {
        self.slot.state()
    }
}

struct MockUserRepository<'a> {
    store: &'a MockStore,
    tx: &'a mut MockTx,
}

#[async_trait]
impl<'a> UserRepository for MockUserRepository<'a> {
    async fn save(&mut self, user: &User) -> Result<i64> {
        if self.store.fail_emails.read().await.contains(&user.email) {
            return Err(StorageError::Constraint(format!(
                "insert rejected for {}",
                user.email
            )));
        }

        let delay = *self.store.write_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let uuid = user.uuid.ok_or_else(|| {
            StorageError::Constraint("user uuid must be assigned before insert".to_string())
        })?;
        if self
            .store
            .users
            .read()
            .await
            .iter()
            .any(|u| u.uuid == Some(uuid))
        {
            return Err(StorageError::Conflict(format!(
                "users.uuid {} already exists",
                uuid
            )));
        }

        let id = self.store.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.staged.push(User {
            id: Some(id),
            addresses: Vec::new(),
            ..user.clone()
        });
        Ok(id)
    }

    async fn get_by_id(&mut self, external_id: Uuid) -> Result<User> {
        if let Some(user) = self
            .tx
            .staged
            .iter()
            .find(|u| u.uuid == Some(external_id))
        {
            return Ok(User {
                addresses: Vec::new(),
                ..user.clone()
            });
        }

        self.store
            .users
            .read()
            .await
            .iter()
            .find(|u| u.uuid == Some(external_id))
            .map(|u| User {
                addresses: Vec::new(),
                ..u.clone()
            })
            .ok_or(StorageError::NotFound(external_id))
    }
}

struct MockAddressRepository<'a> {
    store: &'a MockStore,
    tx: &'a mut MockTx,
}

#[async_trait]
impl<'a> AddressRepository for MockAddressRepository<'a> {
    async fn save(&mut self, user_id: i64, addresses: &[Address]) -> Result<()> {
        if *self.store.fail_on_address.read().await {
            return Err(StorageError::Constraint(
                "address insert rejected".to_string(),
            ));
        }

        let owner = self
            .tx
            .staged
            .iter_mut()
            .find(|u| u.id == Some(user_id))
            .ok_or_else(|| {
                StorageError::Constraint(format!("addresses.user_id {} has no owner", user_id))
            })?;
        owner.addresses.extend_from_slice(addresses);
        Ok(())
    }

    async fn find_by_user(&mut self, user_id: i64) -> Result<Vec<Address>> {
        if let Some(user) = self.tx.staged.iter().find(|u| u.id == Some(user_id)) {
            return Ok(user.addresses.clone());
        }

        Ok(self
            .store
            .users
            .read()
            .await
            .iter()
            .find(|u| u.id == Some(user_id))
            .map(|u| u.addresses.clone())
            .unwrap_or_default())
    }
}
