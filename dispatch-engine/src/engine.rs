use anyhow::anyhow;
use chrono::Utc;
use dispatch_core::config::{DispatchConfig, PhoneConfig};
use dispatch_core::fingerprint::request_fingerprint;
use dispatch_core::{
    DeliveryStatus, DispatchError, DispatchResult, NewNotificationRecord, NotificationRecord,
    NotificationRequest, PhoneNormalizer, RecordFilter, StatusSummary, TemplateRenderer,
};
use dispatch_gateway::{GatewayResult, GatewayTransport};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing;
use uuid::Uuid;

use crate::health::HealthMonitor;
use crate::retry::{self, AttemptClass, RetryPolicy};
use crate::store::{InsertOutcome, RecordStore};

/// How many times a compare-and-set is retried on a record that keeps
/// changing under it.
const CAS_ATTEMPTS: usize = 5;

struct EngineInner {
    config: DispatchConfig,
    normalizer: PhoneNormalizer,
    renderer: TemplateRenderer,
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn GatewayTransport>,
    health: HealthMonitor,
    policy: RetryPolicy,
    send_permits: Semaphore,
}

/// Whether `dispatch` created a record or matched an active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Created,
    Duplicate,
}

/// Orchestrates normalization, dedup, rendering, persistence and delivery of
/// notification requests, and owns every record state transition.
///
/// Failures after a record exists are reported through the record's status
/// and `last_error`, never as an `Err` from `dispatch`.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    pub fn new(
        config: DispatchConfig,
        phone: PhoneConfig,
        renderer: TemplateRenderer,
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn GatewayTransport>,
        health: HealthMonitor,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config);
        let send_permits = Semaphore::new(config.max_concurrent_sends.max(1));
        Self {
            inner: Arc::new(EngineInner {
                normalizer: PhoneNormalizer::new(phone),
                config,
                renderer,
                store,
                gateway,
                health,
                policy,
                send_permits,
            }),
        }
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    pub async fn dispatch(&self, request: NotificationRequest) -> DispatchResult<NotificationRecord> {
        self.dispatch_inner(request).await.map(|(record, _)| record)
    }

    async fn dispatch_inner(
        &self,
        request: NotificationRequest,
    ) -> DispatchResult<(NotificationRecord, Disposition)> {
        let inner = &self.inner;

        let phone = inner.normalizer.normalize(&request.recipient_phone)?;
        let now = Utc::now();
        let fingerprint = request_fingerprint(
            &phone,
            request.event_type,
            &request.subject_id,
            now,
            inner.config.dedup_bucket(),
        );

        if let Some(existing) = inner.store.find_active(&fingerprint).await? {
            tracing::info!(
                "Duplicate {} notification for {} suppressed (record {}, {})",
                request.event_type,
                phone,
                existing.id,
                existing.status
            );
            return Ok((existing, Disposition::Duplicate));
        }

        let message = self.render_message(&request).await?;

        let new_record = NewNotificationRecord {
            request_id: request
                .request_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            request_fingerprint: fingerprint,
            normalized_phone: phone.into_string(),
            recipient_name: request.recipient_name.clone(),
            event_type: request.event_type,
            subject_id: request.subject_id.clone(),
            rendered_message: message,
            created_at: now,
        };

        let record = match inner.store.insert_if_absent(new_record).await? {
            InsertOutcome::Created(record) => record,
            InsertOutcome::Existing(existing) => {
                tracing::info!(
                    "Duplicate {} notification suppressed at insert (record {})",
                    existing.event_type,
                    existing.id
                );
                return Ok((existing, Disposition::Duplicate));
            }
        };

        tracing::debug!(
            "Created notification record {} ({} for subject {})",
            record.id,
            record.event_type,
            record.subject_id
        );

        let record = self.attempt(record).await?;
        Ok((record, Disposition::Created))
    }

    async fn render_message(&self, request: &NotificationRequest) -> DispatchResult<String> {
        if let Some(literal) = &request.template_override {
            return Ok(literal.clone());
        }

        let mut variables = request.variables.clone();
        if let Some(name) = &request.recipient_name {
            variables
                .entry("recipient_name".to_string())
                .or_insert_with(|| name.clone());
        }

        self.inner
            .renderer
            .render(request.event_type, &self.inner.config.language, &variables)
            .await
    }

    /// Dispatches each request in order, pausing `inter_message_delay` after
    /// every request that reached the send path. One request failing never
    /// affects the others; the result has one entry per input.
    pub async fn send_bulk(
        &self,
        requests: Vec<NotificationRequest>,
        inter_message_delay: Duration,
    ) -> Vec<DispatchResult<NotificationRecord>> {
        let total = requests.len();
        let mut results = Vec::with_capacity(total);

        for (index, request) in requests.into_iter().enumerate() {
            let outcome = self.dispatch_inner(request).await;
            let sent_something = matches!(outcome, Ok((_, Disposition::Created)));

            if let Err(e) = &outcome {
                tracing::warn!("Bulk item {} of {} rejected: {}", index + 1, total, e);
            }
            results.push(outcome.map(|(record, _)| record));

            if sent_something && index + 1 < total && !inter_message_delay.is_zero() {
                tokio::time::sleep(inter_message_delay).await;
            }
        }

        let sent = results
            .iter()
            .filter(|r| matches!(r, Ok(record) if record.status == DeliveryStatus::Sent))
            .count();
        let failed = results
            .iter()
            .filter(|r| matches!(r, Ok(record) if record.status == DeliveryStatus::Failed))
            .count();
        let rejected = results.iter().filter(|r| r.is_err()).count();
        tracing::info!(
            "Bulk dispatch finished: {} requests, {} sent, {} failed, {} rejected, {} queued or cancelled",
            total,
            sent,
            failed,
            rejected,
            total - sent - failed - rejected
        );

        results
    }

    /// Runs one send attempt for a pending record, honouring the health gate
    /// and the concurrency limit. Returns the record as stored afterwards.
    async fn attempt(&self, record: NotificationRecord) -> DispatchResult<NotificationRecord> {
        let inner = &self.inner;
        if record.status != DeliveryStatus::Pending {
            return Ok(record);
        }

        let _permit = inner
            .send_permits
            .acquire()
            .await
            .map_err(|e| anyhow!("Send limiter closed: {}", e))?;

        let health = inner.health.status_for_dispatch().await;
        let now = Utc::now();

        if health.is_known_down(now) {
            let reason = format!(
                "gateway unavailable: {}",
                health.last_error.as_deref().unwrap_or("device not connected")
            );
            tracing::warn!("Deferring record {}: {}", record.id, reason);
            let deferred = retry::defer(&inner.policy, &record, &reason, now);
            return self.commit_or_reload(&record, &deferred).await;
        }

        if record.attempt_count as u32 >= inner.policy.max_attempts {
            let mut exhausted = record.clone();
            exhausted.status = DeliveryStatus::Failed;
            exhausted.next_attempt_at = None;
            exhausted.updated_at = now;
            tracing::error!("Record {} has no retry budget left", record.id);
            return self.commit_or_reload(&record, &exhausted).await;
        }

        let mut sending = record.clone();
        sending.status = DeliveryStatus::Sending;
        sending.updated_at = now;
        let claimed = match inner.store.transition(&record, &sending).await? {
            Some(claimed) => claimed,
            None => {
                tracing::debug!("Record {} was claimed elsewhere", record.id);
                return self.reload(record.id).await;
            }
        };

        let result = inner
            .gateway
            .send(&claimed.normalized_phone, &claimed.rendered_message)
            .await;
        let next = retry::apply_attempt(&inner.policy, &claimed, &result, Utc::now());

        match inner.store.transition(&claimed, &next).await? {
            Some(stored) => {
                self.log_attempt(&stored, &result);
                Ok(stored)
            }
            None => self.settle_interrupted(claimed.id, &result).await,
        }
    }

    fn log_attempt(&self, stored: &NotificationRecord, result: &GatewayResult) {
        let error = result.error_message.as_deref().unwrap_or("unknown error");
        if stored.status == DeliveryStatus::Cancelled {
            tracing::info!(
                "Record {} cancelled after attempt {}: {}",
                stored.id,
                stored.attempt_count,
                error
            );
            return;
        }

        match self.inner.policy.classify(result) {
            AttemptClass::Delivered => tracing::info!(
                "Record {} delivered to {} (attempt {})",
                stored.id,
                stored.normalized_phone,
                stored.attempt_count
            ),
            AttemptClass::Permanent => tracing::error!(
                "Record {} failed permanently: {}",
                stored.id,
                error
            ),
            AttemptClass::Transient if stored.status == DeliveryStatus::Pending => tracing::warn!(
                "Record {} attempt {}/{} failed, retrying: {}",
                stored.id,
                stored.attempt_count,
                self.inner.policy.max_attempts,
                error
            ),
            AttemptClass::Transient => tracing::error!(
                "Record {} failed after {} attempts: {}",
                stored.id,
                stored.attempt_count,
                error
            ),
        }
    }

    /// The record changed while the gateway call was in flight, normally
    /// because a cancel was requested. The attempt is applied to the current
    /// row so the request is honoured.
    async fn settle_interrupted(
        &self,
        id: i64,
        result: &GatewayResult,
    ) -> DispatchResult<NotificationRecord> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.reload(id).await?;
            if current.status != DeliveryStatus::Sending {
                tracing::warn!(
                    "Record {} moved to {} during a send attempt; attempt result dropped",
                    id,
                    current.status
                );
                return Ok(current);
            }

            let next = retry::apply_attempt(&self.inner.policy, &current, result, Utc::now());
            if let Some(stored) = self.inner.store.transition(&current, &next).await? {
                self.log_attempt(&stored, result);
                return Ok(stored);
            }
        }

        Err(DispatchError::Storage(anyhow!(
            "Record {} kept changing while its attempt was recorded",
            id
        )))
    }

    async fn commit_or_reload(
        &self,
        current: &NotificationRecord,
        next: &NotificationRecord,
    ) -> DispatchResult<NotificationRecord> {
        match self.inner.store.transition(current, next).await? {
            Some(stored) => Ok(stored),
            None => self.reload(current.id).await,
        }
    }

    async fn reload(&self, id: i64) -> DispatchResult<NotificationRecord> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(DispatchError::NotFound(id))
    }

    pub async fn get_record(&self, id: i64) -> DispatchResult<NotificationRecord> {
        self.reload(id).await
    }

    pub async fn list_records(&self, filter: &RecordFilter) -> DispatchResult<Vec<NotificationRecord>> {
        Ok(self.inner.store.list(filter).await?)
    }

    pub async fn status_summary(&self) -> DispatchResult<StatusSummary> {
        Ok(self.inner.store.count_by_status().await?)
    }

    /// Re-queues a failed record with a fresh retry budget. The retry
    /// scheduler performs the send.
    pub async fn retry(&self, id: i64) -> DispatchResult<NotificationRecord> {
        let record = self.reload(id).await?;
        if record.status != DeliveryStatus::Failed {
            return Err(DispatchError::NotRetryable {
                id,
                status: record.status,
            });
        }

        if let Some(active) = self.inner.store.find_active(&record.request_fingerprint).await? {
            tracing::info!(
                "Record {} not retried: record {} is already {} for the same request",
                id,
                active.id,
                active.status
            );
            return Err(DispatchError::NotRetryable {
                id,
                status: record.status,
            });
        }

        let now = Utc::now();
        let mut requeued = record.clone();
        requeued.status = DeliveryStatus::Pending;
        requeued.attempt_count = 0;
        requeued.cancel_requested = false;
        requeued.next_attempt_at = Some(now);
        requeued.updated_at = now;

        match self.inner.store.transition(&record, &requeued).await? {
            Some(stored) => {
                tracing::info!("Record {} re-queued for delivery", id);
                Ok(stored)
            }
            None => {
                let current = self.reload(id).await?;
                Err(DispatchError::NotRetryable {
                    id,
                    status: current.status,
                })
            }
        }
    }

    /// Re-queues every failed record matching `filter` (status is forced to
    /// `Failed`, paging fields are ignored). Records that cannot be re-queued
    /// are skipped.
    pub async fn retry_failed(&self, filter: &RecordFilter) -> DispatchResult<Vec<NotificationRecord>> {
        let mut page = RecordFilter {
            status: Some(DeliveryStatus::Failed),
            limit: Some(RecordFilter::MAX_LIMIT),
            offset: Some(0),
            ..filter.clone()
        };

        let mut requeued = Vec::new();
        // Re-queued rows leave the failed set, so only skipped rows move the offset.
        let mut skipped = 0i64;
        loop {
            page.offset = Some(skipped);
            let failed = self.inner.store.list(&page).await?;
            if failed.is_empty() {
                break;
            }

            for record in failed {
                match self.retry(record.id).await {
                    Ok(record) => requeued.push(record),
                    Err(DispatchError::Storage(e)) => return Err(DispatchError::Storage(e)),
                    Err(e) => {
                        tracing::debug!("Skipping record {}: {}", record.id, e);
                        skipped += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Re-queued {} failed notifications ({} skipped)",
            requeued.len(),
            skipped
        );
        Ok(requeued)
    }

    /// Cancels a pending record. A record that is mid-send only gets a cancel
    /// request: it keeps its fingerprint until the attempt resolves, then
    /// ends `Sent` if the gateway accepted the message and `Cancelled`
    /// otherwise.
    pub async fn cancel(&self, id: i64) -> DispatchResult<NotificationRecord> {
        for _ in 0..CAS_ATTEMPTS {
            let record = self.reload(id).await?;
            if record.status.is_terminal() {
                return Err(DispatchError::AlreadyTerminal {
                    id,
                    status: record.status,
                });
            }

            let mut next = record.clone();
            // Strictly newer, so the in-flight attempt's compare-and-set misses.
            next.updated_at = Utc::now().max(record.updated_at + chrono::Duration::microseconds(1));

            if record.status == DeliveryStatus::Sending {
                if record.cancel_requested {
                    return Ok(record);
                }
                next.cancel_requested = true;
                if let Some(stored) = self.inner.store.transition(&record, &next).await? {
                    tracing::info!("Cancel requested for record {} while it is being sent", id);
                    return Ok(stored);
                }
                continue;
            }

            next.status = DeliveryStatus::Cancelled;
            next.next_attempt_at = None;
            if let Some(stored) = self.inner.store.transition(&record, &next).await? {
                tracing::info!("Record {} cancelled (was {})", id, record.status);
                return Ok(stored);
            }
        }

        Err(DispatchError::Storage(anyhow!(
            "Record {} kept changing while being cancelled",
            id
        )))
    }

    /// Sends every pending record whose retry time has passed. Returns the
    /// number of records picked up.
    pub async fn process_due_retries(&self) -> DispatchResult<usize> {
        let inner = &self.inner;
        let due = inner
            .store
            .due_for_retry(Utc::now(), inner.config.retry_batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        tracing::debug!("Found {} notifications due for delivery", due.len());

        let picked = due.len();
        stream::iter(due)
            .for_each_concurrent(inner.config.max_concurrent_sends.max(1), |record| async move {
                let id = record.id;
                if let Err(e) = self.attempt(record).await {
                    tracing::error!("Retry of record {} failed: {}", id, e);
                }
            })
            .await;

        Ok(picked)
    }

    /// Returns records stuck in `Sending` past the stall threshold to `Pending`.
    pub async fn recover_stalled(&self) -> DispatchResult<usize> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.inner.config.stalled_send_after())
            .map_err(|e| anyhow!("Invalid stall threshold: {}", e))?;
        let requeued = self.inner.store.requeue_stalled(now - threshold, now).await?;
        if requeued > 0 {
            tracing::warn!("Recovered {} notifications stuck in sending", requeued);
        }
        Ok(requeued)
    }
}

