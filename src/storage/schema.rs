//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Users table schema.
#[derive(Iden)]
pub enum Users {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "uuid"]
    Uuid,
    #[iden = "first_name"]
    FirstName,
    #[iden = "last_name"]
    LastName,
    #[iden = "email"]
    Email,
    #[iden = "phone_number"]
    PhoneNumber,
    #[iden = "deleted_at"]
    DeletedAt,
}

/// Addresses table schema.
#[derive(Iden)]
pub enum Addresses {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "user_id"]
    UserId,
    #[iden = "street"]
    Street,
    #[iden = "city"]
    City,
    #[iden = "state"]
    State,
    #[iden = "zip_code"]
    ZipCode,
    #[iden = "country"]
    Country,
}

/// Maximum stored length of an address zip code.
pub const ZIP_CODE_MAX_LEN: usize = 20;

/// SQL for creating the SQLite tables.
///
/// SQLite ignores VARCHAR lengths, so the zip code bound is a CHECK.
pub const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    first_name TEXT,
    last_name TEXT,
    email TEXT NOT NULL,
    phone_number TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS addresses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    street TEXT,
    city TEXT,
    state TEXT,
    zip_code TEXT CHECK (zip_code IS NULL OR length(zip_code) <= 20),
    country TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_addresses_user_id ON addresses(user_id);
"#;

/// SQL for creating the PostgreSQL tables.
pub const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    uuid UUID NOT NULL UNIQUE,
    first_name VARCHAR(255),
    last_name VARCHAR(255),
    email VARCHAR(255) NOT NULL,
    phone_number VARCHAR(32) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS addresses (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    street VARCHAR(255),
    city VARCHAR(255),
    state VARCHAR(255),
    zip_code VARCHAR(20),
    country VARCHAR(255),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_addresses_user_id ON addresses(user_id);
"#;
