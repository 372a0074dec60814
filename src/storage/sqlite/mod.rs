//! SQLite implementations of the storage interfaces.

mod address_repository;
mod user_repository;

use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{
    AddressRepository, Result, TxSlot, UnitOfWork, UnitOfWorkFactory, UnitOfWorkState,
    UserRepository,
};
use crate::storage::schema::SQLITE_SCHEMA;

pub use address_repository::SqliteAddressRepository;
pub use user_repository::SqliteUserRepository;

/// Creates SQLite units of work over a shared pool.
#[derive(Clone)]
pub struct SqliteUnitOfWorkFactory {
    pool: SqlitePool,
}

impl SqliteUnitOfWorkFactory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SQLITE_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl UnitOfWorkFactory for SqliteUnitOfWorkFactory {
    fn create(&self) -> Box<dyn UnitOfWork> {
        Box::new(SqliteUnitOfWork::new(self.pool.clone()))
    }
}

/// One SQLite transaction with scoped repositories.
pub struct SqliteUnitOfWork {
    pool: SqlitePool,
    slot: TxSlot<Transaction<'static, Sqlite>>,
}

impl SqliteUnitOfWork {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            slot: TxSlot::new(),
        }
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    async fn begin(&mut self) -> Result<()> {
        self.slot.ensure_startable()?;
        let tx = self.pool.begin().await?;
        self.slot.start(tx)
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.slot.finish(UnitOfWorkState::Committed)?;
        if let Err(e) = tx.commit().await {
            self.slot.mark_rolled_back();
            return Err(e.into());
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.slot.finish(UnitOfWorkState::RolledBack)?;
        tx.rollback().await?;
        Ok(())
    }

    fn users(&mut self) -> Result<Box<dyn UserRepository + '_>> {
        Ok(Box::new(SqliteUserRepository::new(self.slot.active_mut()?)))
    }

    fn addresses(&mut self) -> Result<Box<dyn AddressRepository + '_>> {
        Ok(Box::new(SqliteAddressRepository::new(
            self.slot.active_mut()?,
        )))
    }

    fn state(&self) -> UnitOfWorkState {
        self.slot.state()
    }
}
