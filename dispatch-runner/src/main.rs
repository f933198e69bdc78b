use anyhow::Result;
use dispatch_api::ApiState;
use dispatch_core::{
    Config, ContactResolver, DispatchContext, PgContactStore, PgTemplateStore, TemplateRenderer,
};
use dispatch_engine::{scheduler, DispatchEngine, HealthMonitor, PgRecordStore};
use dispatch_gateway::{GatewayTransport, ScriptedGateway, WablasClient};
use dispatch_intake::NotificationIntake;
use std::sync::Arc;
use tokio;
use tracing;
use tracing_subscriber;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_gateway(config: &Config) -> Result<Arc<dyn GatewayTransport>> {
    if config.gateway.dry_run {
        tracing::warn!("GATEWAY_DRY_RUN enabled, messages are recorded but never sent");
        return Ok(Arc::new(ScriptedGateway::new()));
    }
    if config.gateway.token.is_empty() {
        tracing::warn!("GATEWAY_TOKEN not set, gateway requests will be rejected");
    }
    Ok(Arc::new(WablasClient::new(&config.gateway)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_tracing();

    tracing::info!("Starting notification dispatch server");

    let config = Config::from_env();
    let ctx = DispatchContext::new(config).await?;
    let config = ctx.config.clone();

    tracing::info!("Dispatch context initialized");

    let gateway = build_gateway(&config)?;
    let health = HealthMonitor::new(gateway.clone(), config.health.clone());
    let renderer = TemplateRenderer::new(Arc::new(PgTemplateStore::new(ctx.db_pool.clone())));
    let store = Arc::new(PgRecordStore::new(ctx.db_pool.clone()));

    let engine = DispatchEngine::new(
        config.dispatch.clone(),
        config.phone.clone(),
        renderer,
        store,
        gateway,
        health.clone(),
    );

    tokio::spawn(health.run());

    let scheduler_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler::run(scheduler_engine).await {
            tracing::error!("Retry scheduler error: {}", e);
        }
    });

    if config.redpanda.intake_enabled {
        let resolver = ContactResolver::new(Arc::new(PgContactStore::new(ctx.db_pool.clone())));
        let intake = NotificationIntake::new(resolver, engine.clone());
        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatch_intake::consumer::run(ctx_clone, intake).await {
                tracing::error!("Notification intake error: {}", e);
            }
        });
    } else {
        tracing::info!("Event intake disabled, serving operator API only");
    }

    let state = ApiState {
        engine,
        operator_token: config.server.operator_token.clone(),
        default_bulk_delay: config.dispatch.bulk_delay(),
    };

    // API server runs in main task
    tokio::select! {
        result = dispatch_api::run(state, &config.server) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
