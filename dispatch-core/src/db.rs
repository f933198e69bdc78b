use anyhow::{anyhow, Result};
use diesel::Connection;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tokio::time::Duration;
use tracing;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!(
        "Setting up database pool for {} (max {} connections)",
        mask_database_url(&config.url),
        config.max_connections
    );

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("Failed to create connection pool: {}", e))?;

    wait_for_database(&pool).await?;
    Ok(Arc::new(pool))
}

/// Checks out one connection, retrying with 1s, 2s, 4s, 8s waits so the
/// service can start alongside its database.
async fn wait_for_database(pool: &DbPool) -> Result<()> {
    let mut last_error = anyhow!("no connection attempt made");

    for attempt in 1..=CONNECT_ATTEMPTS {
        last_error = match tokio::time::timeout(CONNECT_TIMEOUT, pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!("Database connection established (attempt {})", attempt);
                return Ok(());
            }
            Ok(Err(e)) => anyhow!("Database connection failed: {}", e),
            Err(_) => anyhow!("Database connection timed out after {:?}", CONNECT_TIMEOUT),
        };
        tracing::warn!("Attempt {}/{}: {}", attempt, CONNECT_ATTEMPTS, last_error);

        if attempt < CONNECT_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
        }
    }

    tracing::error!("All {} database connection attempts failed", CONNECT_ATTEMPTS);
    Err(last_error)
}

/// Applies pending embedded migrations on a blocking thread.
pub async fn run_migrations(database_url: &str) -> Result<()> {
    let url = database_url.to_string();

    let applied = tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::establish(&url)
            .map_err(|e| anyhow!("Failed to connect for migrations: {}", e))?;
        let versions = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow!("Failed to run migrations: {}", e))?;
        Ok(versions.len())
    })
    .await
    .map_err(|e| anyhow!("Migration task panicked: {}", e))??;

    tracing::info!("Applied {} pending migration(s)", applied);
    Ok(())
}

pub(crate) fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let (before_at, after_at) = url.split_at(at_pos);
        if let Some(colon_pos) = before_at.rfind(':') {
            let (protocol_user, _password) = before_at.split_at(colon_pos);
            format!("{}:****{}", protocol_user, after_at)
        } else {
            "postgres://****@****".to_string()
        }
    } else {
        "Invalid URL format".to_string()
    }
}
