//! SQLite UserRepository implementation.

use async_trait::async_trait;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::{Row, Sqlite, Transaction};
use tracing::error;
use uuid::Uuid;

use crate::domain::User;
use crate::storage::schema::Users;
use crate::storage::{Result, StorageError, UserRepository};

/// User rows, scoped to a borrowed transaction.
pub struct SqliteUserRepository<'a> {
    tx: &'a mut Transaction<'static, Sqlite>,
}

impl<'a> SqliteUserRepository<'a> {
    pub fn new(tx: &'a mut Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<'a> UserRepository for SqliteUserRepository<'a> {
    async fn save(&mut self, user: &User) -> Result<i64> {
        let uuid = user.uuid.ok_or_else(|| {
            StorageError::Constraint("user uuid must be assigned before insert".to_string())
        })?;

        let query = Query::insert()
            .into_table(Users::Table)
            .columns([
                Users::Uuid,
                Users::FirstName,
                Users::LastName,
                Users::Email,
                Users::PhoneNumber,
            ])
            .values_panic([
                uuid.to_string().into(),
                user.first_name.clone().into(),
                user.last_name.clone().into(),
                user.email.clone().into(),
                user.phone_number.clone().into(),
            ])
            .returning_col(Users::Id)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_one(&mut **self.tx)
            .await
            .map_err(|e| {
                error!(user_uuid = %uuid, error = %e, "Failed to insert user");
                StorageError::from(e)
            })?;

        Ok(row.try_get(0)?)
    }

    async fn get_by_id(&mut self, external_id: Uuid) -> Result<User> {
        let query = Query::select()
            .columns([
                Users::Id,
                Users::Uuid,
                Users::FirstName,
                Users::LastName,
                Users::Email,
                Users::PhoneNumber,
            ])
            .from(Users::Table)
            .and_where(Expr::col(Users::Uuid).eq(external_id.to_string()))
            .and_where(Expr::col(Users::DeletedAt).is_null())
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&mut **self.tx)
            .await?
            .ok_or(StorageError::NotFound(external_id))?;

        let raw_uuid: String = row.try_get("uuid")?;
        let uuid = Uuid::parse_str(&raw_uuid)
            .map_err(|e| StorageError::Corrupt(format!("users.uuid '{}': {}", raw_uuid, e)))?;

        Ok(User {
            id: Some(row.try_get("id")?),
            uuid: Some(uuid),
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            email: row.try_get("email")?,
            phone_number: row.try_get("phone_number")?,
            addresses: Vec::new(),
        })
    }
}
