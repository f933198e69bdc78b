use std::sync::Arc;
use crate::config::Config;
use crate::db::{create_pool, run_migrations, DbPool};
use crate::redpanda::{create_consumer, RedpandaConsumer};

/// Shared process-wide handles: configuration and the database pool.
#[derive(Clone)]
pub struct DispatchContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
}

impl DispatchContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_pool(&config.database).await?;
        run_migrations(&config.database.url).await?;

        Ok(DispatchContext {
            config: Arc::new(config),
            db_pool,
        })
    }

    pub fn create_consumer(&self, group_id: Option<&str>) -> anyhow::Result<RedpandaConsumer> {
        create_consumer(&self.config.redpanda, group_id)
    }
}
