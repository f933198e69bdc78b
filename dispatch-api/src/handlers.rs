use axum::{
    extract::{Extension, Path, Query},
    response::Json,
};
use dispatch_core::{
    DeliveryStatus, GatewayHealthStatus, NotificationRecord, NotificationRequest, RecordFilter,
    StatusSummary,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ApiError, ErrorBody};
use crate::server::ApiState;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dispatch-api"
    }))
}

pub async fn list_records(
    Extension(state): Extension<ApiState>,
    Query(filter): Query<RecordFilter>,
) -> ApiResult<Vec<NotificationRecord>> {
    Ok(Json(state.engine.list_records(&filter).await?))
}

pub async fn records_summary(Extension(state): Extension<ApiState>) -> ApiResult<StatusSummary> {
    Ok(Json(state.engine.status_summary().await?))
}

pub async fn get_record(
    Extension(state): Extension<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<NotificationRecord> {
    Ok(Json(state.engine.get_record(id).await?))
}

pub async fn retry_record(
    Extension(state): Extension<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<NotificationRecord> {
    Ok(Json(state.engine.retry(id).await?))
}

pub async fn cancel_record(
    Extension(state): Extension<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<NotificationRecord> {
    Ok(Json(state.engine.cancel(id).await?))
}

#[derive(Serialize)]
pub struct RetryFailedResponse {
    pub requeued: usize,
    pub records: Vec<NotificationRecord>,
}

/// Filter comes from the query string; `status` is ignored.
pub async fn retry_failed(
    Extension(state): Extension<ApiState>,
    Query(filter): Query<RecordFilter>,
) -> ApiResult<RetryFailedResponse> {
    let records = state.engine.retry_failed(&filter).await?;
    Ok(Json(RetryFailedResponse {
        requeued: records.len(),
        records,
    }))
}

pub async fn dispatch(
    Extension(state): Extension<ApiState>,
    Json(request): Json<NotificationRequest>,
) -> ApiResult<NotificationRecord> {
    Ok(Json(state.engine.dispatch(request).await?))
}

#[derive(Deserialize)]
pub struct BulkDispatchBody {
    pub requests: Vec<NotificationRequest>,
    #[serde(default, alias = "interMessageDelayMs")]
    pub inter_message_delay_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct BulkItem {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<NotificationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Serialize)]
pub struct BulkDispatchResponse {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub rejected: usize,
    pub results: Vec<BulkItem>,
}

pub async fn dispatch_bulk(
    Extension(state): Extension<ApiState>,
    Json(body): Json<BulkDispatchBody>,
) -> Json<BulkDispatchResponse> {
    let delay = body
        .inter_message_delay_ms
        .map(Duration::from_millis)
        .unwrap_or(state.default_bulk_delay);

    let outcomes = state.engine.send_bulk(body.requests, delay).await;

    let mut response = BulkDispatchResponse {
        total: outcomes.len(),
        sent: 0,
        failed: 0,
        rejected: 0,
        results: Vec::with_capacity(outcomes.len()),
    };

    for (index, outcome) in outcomes.into_iter().enumerate() {
        let item = match outcome {
            Ok(record) => {
                match record.status {
                    DeliveryStatus::Sent => response.sent += 1,
                    DeliveryStatus::Failed => response.failed += 1,
                    _ => {}
                }
                BulkItem {
                    index,
                    record: Some(record),
                    error: None,
                }
            }
            Err(e) => {
                response.rejected += 1;
                BulkItem {
                    index,
                    record: None,
                    error: Some(ErrorBody::from(&e)),
                }
            }
        };
        response.results.push(item);
    }

    Json(response)
}

pub async fn gateway_health(Extension(state): Extension<ApiState>) -> Json<GatewayHealthStatus> {
    Json(state.engine.health().get_cached())
}

pub async fn gateway_health_check(Extension(state): Extension<ApiState>) -> Json<GatewayHealthStatus> {
    Json(state.engine.health().check_now().await)
}
