//! PostgreSQL implementations of the storage interfaces.

mod address_repository;
mod user_repository;

use async_trait::async_trait;
use sqlx::{Postgres, PgPool, Transaction};

use super::{
    AddressRepository, Result, TxSlot, UnitOfWork, UnitOfWorkFactory, UnitOfWorkState,
    UserRepository,
};
use crate::storage::schema::POSTGRES_SCHEMA;

pub use address_repository::PostgresAddressRepository;
pub use user_repository::PostgresUserRepository;

/// Creates PostgreSQL units of work over a shared pool.
#[derive(Clone)]
pub struct PostgresUnitOfWorkFactory {
    pool: PgPool,
}

impl PostgresUnitOfWorkFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(POSTGRES_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl UnitOfWorkFactory for PostgresUnitOfWorkFactory {
    fn create(&self) -> Box<dyn UnitOfWork> {
        Box::new(PostgresUnitOfWork::new(self.pool.clone()))
    }
}

/// One PostgreSQL transaction with scoped repositories.
pub struct PostgresUnitOfWork {
    pool: PgPool,
    slot: TxSlot<Transaction<'static, Postgres>>,
}

impl PostgresUnitOfWork {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            slot: TxSlot::new(),
        }
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
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
        Ok(Box::new(PostgresUserRepository::new(self.slot.active_mut()?)))
    }

    fn addresses(&mut self) -> Result<Box<dyn AddressRepository + '_>> {
        Ok(Box::new(PostgresAddressRepository::new(
            self.slot.active_mut()?,
        )))
    }

    fn state(&self) -> UnitOfWorkState {
        self.slot.state()
    }
}
