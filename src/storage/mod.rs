//! Transactional storage for users and their addresses.
//!
//! Every write goes through a [`UnitOfWork`]: one database transaction that
//! hands out repositories scoped to it. Repositories never own the
//! transaction; they borrow it from the unit of work for as long as the
//! caller holds them.
//!
//! Backends:
//! - `sqlite` (feature `sqlite`)
//! - `postgres` (feature `postgres`)
//! - `mock`: in-memory store with failure injection, for tests

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Address, User};

pub mod mock;
pub mod schema;
mod unit_of_work;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::{MockStore, MockUnitOfWorkFactory};
pub use unit_of_work::{TxSlot, UnitOfWorkState};

#[cfg(feature = "postgres")]
pub use postgres::PostgresUnitOfWorkFactory;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteUnitOfWorkFactory;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("User not found: {0}")]
    NotFound(Uuid),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("No active transaction")]
    TransactionNotActive,

    #[error("Transaction already started")]
    TransactionAlreadyStarted,

    #[error("Unit of work already committed or rolled back")]
    TransactionFinished,

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StorageError {
    /// Whether retrying the same operation later could succeed.
    ///
    /// Connection and pool failures are transient; constraint violations and
    /// misuse of the unit of work are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        let kind = match &err {
            sqlx::Error::Database(db) => Some((db.kind(), db.message().to_string())),
            _ => None,
        };

        match kind {
            Some((ErrorKind::UniqueViolation, message)) => StorageError::Conflict(message),
            Some((
                ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation,
                message,
            )) => StorageError::Constraint(message),
            _ => StorageError::Database(err),
        }
    }
}

/// Reads and writes user rows inside a transaction.
#[async_trait]
pub trait UserRepository: Send {
    /// Insert the user row and return the id assigned by the store.
    ///
    /// The user's external identifier must already be set.
    async fn save(&mut self, user: &User) -> Result<i64>;

    /// Load a user (without addresses) by external identifier.
    ///
    /// Fails with [`StorageError::NotFound`] when absent.
    async fn get_by_id(&mut self, external_id: Uuid) -> Result<User>;
}

/// Reads and writes address rows inside a transaction.
#[async_trait]
pub trait AddressRepository: Send {
    /// Insert all addresses for an already-inserted user.
    async fn save(&mut self, user_id: i64, addresses: &[Address]) -> Result<()>;

    /// Load a user's addresses in insertion order.
    async fn find_by_user(&mut self, user_id: i64) -> Result<Vec<Address>>;
}

/// A single transactional boundary.
///
/// States: `Unstarted -> Active -> (Committed | RolledBack)`. Repository
/// accessors only succeed while `Active`. Once committed or rolled back the
/// unit of work is spent; every further call fails with
/// [`StorageError::TransactionFinished`].
#[async_trait]
pub trait UnitOfWork: Send {
    /// Open the underlying transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Commit the transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// User repository bound to this transaction.
    fn users(&mut self) -> Result<Box<dyn UserRepository + '_>>;

    /// Address repository bound to this transaction.
    fn addresses(&mut self) -> Result<Box<dyn AddressRepository + '_>>;

    /// Current lifecycle state.
    fn state(&self) -> UnitOfWorkState;
}

/// Creates fresh, unstarted units of work.
pub trait UnitOfWorkFactory: Send + Sync {
    fn create(&self) -> Box<dyn UnitOfWork>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Sqlite,
    Postgres,
}

/// Storage configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Upper bound on pooled database connections.
    pub max_connections: u32,
    /// SQLite-specific configuration.
    pub sqlite: SqliteConfig,
    /// PostgreSQL-specific configuration.
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Sqlite,
            max_connections: 10,
            sqlite: SqliteConfig::default(),
            postgres: PostgresConfig::default(),
        }
    }
}

/// SQLite-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file path.
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "./data/users.db".to_string(),
        }
    }
}

/// PostgreSQL-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// PostgreSQL connection URI.
    pub uri: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            uri: "postgres://localhost:5432/users".to_string(),
        }
    }
}

/// Initialize storage based on configuration.
///
/// Connects the pool, creates the schema if missing, and returns the unit of
/// work factory for the configured backend.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn UnitOfWorkFactory>, Box<dyn std::error::Error>> {
    match config.storage_type {
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            info!(path = %config.sqlite.path, "Storage: sqlite");

            if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&format!("sqlite:{}?mode=rwc", config.sqlite.path))
                .await?;

            let factory = SqliteUnitOfWorkFactory::new(pool);
            factory.init().await?;
            Ok(Arc::new(factory))
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            info!("Storage: postgres");

            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.postgres.uri)
                .await?;

            let factory = PostgresUnitOfWorkFactory::new(pool);
            factory.init().await?;
            Ok(Arc::new(factory))
        }
        #[allow(unreachable_patterns)]
        ref other => Err(format!("Storage type {:?} not enabled in this build", other).into()),
    }
}
