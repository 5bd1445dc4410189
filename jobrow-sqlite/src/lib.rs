#![doc = include_str!("../README.md")]

pub mod schema;
pub mod store;
pub(crate) mod types;

pub use schema::schema_sql;
pub use store::SqliteStore;
use sqlx::migrate::Migrator;
pub static MIGRATOR: Migrator = sqlx::migrate!();
