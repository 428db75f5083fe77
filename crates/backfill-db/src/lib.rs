pub mod config;
pub mod database;
pub mod record_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use record_repository::PgRecordStore;
