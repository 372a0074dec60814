//! User importer
//!
//! Drains batches of user records into storage with bounded concurrency.
//! Each record is written directly in its own transaction; records that
//! cannot be written go to a delayed message queue for a consumer to retry,
//! and records that cannot be queued are appended to a local backup file.

pub mod bus;
pub mod config;
pub mod domain;
pub mod events;
pub mod import;
pub mod services;
pub mod storage;
pub mod utils;
