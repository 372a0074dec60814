//! Domain services.

mod user;

pub use user::{create_in_transaction, DefaultUserService, ServiceError, UserService};
