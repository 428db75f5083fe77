use backfill_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::record_repository::PgRecordStore;

/// Owns the connection pool, runs migrations and vends record stores.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Health check failed: {e}")))?;
        Ok(())
    }

    /// A [`PgRecordStore`] over `collection`, after checking connectivity.
    pub async fn record_store(&self, collection: &str) -> Result<PgRecordStore, AppError> {
        validate_collection(collection)?;
        let store = PgRecordStore::new(self.pool.clone(), collection);
        let documents = store.count_all().await?;
        tracing::info!(collection, documents, "Connected to record store");
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn validate_collection(name: &str) -> Result<(), AppError> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AppError::ConfigError(format!(
            "Invalid collection name '{name}': use letters, digits, '_', '-' or '.'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names() {
        assert!(validate_collection("tickets").is_ok());
        assert!(validate_collection("support.tickets_2024-q1").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("tickets; drop").is_err());
        assert!(validate_collection(&"x".repeat(256)).is_err());
    }
}
