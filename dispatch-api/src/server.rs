use anyhow::Result;
use axum::{
    extract::Extension,
    http::HeaderValue,
    middleware,
    routing::{get, post},
    Router,
};
use dispatch_core::config::ServerConfig;
use dispatch_engine::DispatchEngine;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing;

use crate::auth;
use crate::handlers;

/// Shared state handed to every handler through an `Extension`.
#[derive(Clone)]
pub struct ApiState {
    pub engine: DispatchEngine,
    pub operator_token: Option<String>,
    /// Bulk inter-message delay when the request does not set one.
    pub default_bulk_delay: Duration,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
        return CorsLayer::permissive();
    }

    let mut cors = CorsLayer::new();
    for origin in origins {
        if let Ok(parsed) = origin.parse::<HeaderValue>() {
            cors = cors.allow_origin(parsed);
        }
    }
    cors.allow_methods(Any).allow_headers(Any)
}

pub fn router(state: ApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/records", get(handlers::list_records))
        .route("/api/v1/records/summary", get(handlers::records_summary))
        .route("/api/v1/records/retry-failed", post(handlers::retry_failed))
        .route("/api/v1/records/:id", get(handlers::get_record))
        .route("/api/v1/records/:id/retry", post(handlers::retry_record))
        .route("/api/v1/records/:id/cancel", post(handlers::cancel_record))
        .route("/api/v1/dispatch", post(handlers::dispatch))
        .route("/api/v1/dispatch/bulk", post(handlers::dispatch_bulk))
        .route("/api/v1/gateway/health", get(handlers::gateway_health))
        .route("/api/v1/gateway/health/check", post(handlers::gateway_health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origins))
                .layer(Extension(state))
                .layer(middleware::from_fn(auth::auth_middleware)),
        )
}

pub async fn run(state: ApiState, config: &ServerConfig) -> Result<()> {
    if state.operator_token.is_none() {
        tracing::warn!("OPERATOR_API_TOKEN not set, operator API is unauthenticated");
    }

    let app = router(state, &config.cors_origins);

    let addr: SocketAddr = format!("{}:{}", config.host, config.api_port).parse()?;
    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
