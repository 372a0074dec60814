//! PostgreSQL AddressRepository implementation.

use async_trait::async_trait;
use sea_query::{Expr, Order, Query, PostgresQueryBuilder};
use sqlx::{Row, Postgres, Transaction};
use tracing::error;

use crate::domain::Address;
use crate::storage::schema::Addresses;
use crate::storage::{AddressRepository, Result, StorageError};

/// Address rows, scoped to a borrowed transaction.
pub struct PostgresAddressRepository<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl<'a> PostgresAddressRepository<'a> {
    pub fn new(tx: &'a mut Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<'a> AddressRepository for PostgresAddressRepository<'a> {
    async fn save(&mut self, user_id: i64, addresses: &[Address]) -> Result<()> {
        for address in addresses {
            let query = Query::insert()
                .into_table(Addresses::Table)
                .columns([
                    Addresses::Street,
                    Addresses::City,
                    Addresses::State,
                    Addresses::ZipCode,
                    Addresses::Country,
                    Addresses::UserId,
                ])
                .values_panic([
                    address.street.clone().into(),
                    address.city.clone().into(),
                    address.state.clone().into(),
                    address.zip_code.clone().into(),
                    address.country.clone().into(),
                    user_id.into(),
                ])
                .to_string(PostgresQueryBuilder);

            sqlx::query(&query)
                .execute(&mut **self.tx)
                .await
                .map_err(|e| {
                    error!(user_id, ?address, error = %e, "Failed to insert address");
                    StorageError::from(e)
                })?;
        }

        Ok(())
    }

    async fn find_by_user(&mut self, user_id: i64) -> Result<Vec<Address>> {
        let query = Query::select()
            .columns([
                Addresses::Street,
                Addresses::City,
                Addresses::State,
                Addresses::ZipCode,
                Addresses::Country,
            ])
            .from(Addresses::Table)
            .and_where(Expr::col(Addresses::UserId).eq(user_id))
            .order_by(Addresses::Id, Order::Asc)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&mut **self.tx).await?;

        let mut addresses = Vec::with_capacity(rows.len());
        for row in rows {
            addresses.push(Address {
                street: row.try_get("street")?,
                city: row.try_get("city")?,
                state: row.try_get("state")?,
                zip_code: row.try_get("zip_code")?,
                country: row.try_get("country")?,
            });
        }

        Ok(addresses)
    }
}
