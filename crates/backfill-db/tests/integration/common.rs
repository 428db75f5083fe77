use std::time::Duration;

use backfill_db::{Database, PgRecordStore};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

const CONNECT_ATTEMPTS: u32 = 30;

/// Start PostgreSQL 16, apply the crate's migrations and return a pool.
///
/// Keep the returned container alive for the whole test; dropping it stops
/// the database.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "backfill_test")
        .start()
        .await
        .expect("PostgreSQL container should start");

    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("mapped PostgreSQL port");
    let url = format!("postgresql://postgres:postgres@{host}:{port}/backfill_test");

    let pool = connect_with_retry(&url).await;
    Database::from_pool(pool.clone())
        .migrate()
        .await
        .expect("migrations should apply");

    (pool, container)
}

/// The server may log readiness before it accepts TCP connections.
async fn connect_with_retry(url: &str) -> PgPool {
    let mut last_error = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => return pool,
            Err(e) => last_error = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("PostgreSQL unreachable after {CONNECT_ATTEMPTS} attempts: {last_error:?}");
}

/// A store over `collection` seeded with `docs`.
pub async fn seeded_store(
    pool: &PgPool,
    collection: &str,
    docs: &[(&str, serde_json::Value)],
) -> PgRecordStore {
    let store = PgRecordStore::new(pool.clone(), collection);
    for (id, doc) in docs {
        store.upsert(id, doc).await.expect("seed document");
    }
    store
}
