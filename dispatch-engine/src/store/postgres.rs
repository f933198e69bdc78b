use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use dispatch_core::schema::notification_records;
use dispatch_core::{
    DbPool, DeliveryStatus, NewNotificationRecord, NotificationRecord, RecordFilter, StatusSummary,
};
use std::sync::Arc;
use tracing;

use super::{InsertOutcome, RecordStore, STALLED_CANCELLED_ERROR, STALLED_SEND_ERROR};

#[derive(Queryable, Selectable)]
#[diesel(table_name = notification_records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct RecordRow {
    id: i64,
    request_id: String,
    request_fingerprint: String,
    normalized_phone: String,
    recipient_name: Option<String>,
    event_type: String,
    subject_id: String,
    rendered_message: String,
    status: String,
    attempt_count: i32,
    last_error: Option<String>,
    provider_message_id: Option<String>,
    gateway_response_raw: Option<String>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for NotificationRecord {
    type Error = anyhow::Error;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(NotificationRecord {
            event_type: row
                .event_type
                .parse()
                .map_err(|e| anyhow!("Record {}: {}", row.id, e))?,
            status: row
                .status
                .parse()
                .map_err(|e| anyhow!("Record {}: {}", row.id, e))?,
            id: row.id,
            request_id: row.request_id,
            request_fingerprint: row.request_fingerprint,
            normalized_phone: row.normalized_phone,
            recipient_name: row.recipient_name,
            subject_id: row.subject_id,
            rendered_message: row.rendered_message,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            provider_message_id: row.provider_message_id,
            gateway_response_raw: row.gateway_response_raw,
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            next_attempt_at: row.next_attempt_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = notification_records)]
struct NewRecordRow<'a> {
    request_id: &'a str,
    request_fingerprint: &'a str,
    normalized_phone: &'a str,
    recipient_name: Option<&'a str>,
    event_type: &'a str,
    subject_id: &'a str,
    rendered_message: &'a str,
    status: &'a str,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    next_attempt_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'a> From<&'a NewNotificationRecord> for NewRecordRow<'a> {
    fn from(record: &'a NewNotificationRecord) -> Self {
        NewRecordRow {
            request_id: &record.request_id,
            request_fingerprint: &record.request_fingerprint,
            normalized_phone: &record.normalized_phone,
            recipient_name: record.recipient_name.as_deref(),
            event_type: record.event_type.as_str(),
            subject_id: &record.subject_id,
            rendered_message: &record.rendered_message,
            status: DeliveryStatus::Pending.as_str(),
            attempt_count: 0,
            created_at: record.created_at,
            next_attempt_at: Some(record.created_at),
            updated_at: record.created_at,
        }
    }
}

/// Mutable columns of a record. `None` clears the column.
#[derive(AsChangeset)]
#[diesel(table_name = notification_records, treat_none_as_null = true)]
struct RecordChanges<'a> {
    status: &'a str,
    attempt_count: i32,
    last_error: Option<&'a str>,
    provider_message_id: Option<&'a str>,
    gateway_response_raw: Option<&'a str>,
    cancel_requested: bool,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'a> From<&'a NotificationRecord> for RecordChanges<'a> {
    fn from(record: &'a NotificationRecord) -> Self {
        RecordChanges {
            status: record.status.as_str(),
            attempt_count: record.attempt_count,
            last_error: record.last_error.as_deref(),
            provider_message_id: record.provider_message_id.as_deref(),
            gateway_response_raw: record.gateway_response_raw.as_deref(),
            cancel_requested: record.cancel_requested,
            last_attempt_at: record.last_attempt_at,
            next_attempt_at: record.next_attempt_at,
            updated_at: record.updated_at,
        }
    }
}

fn active_statuses() -> Vec<&'static str> {
    DeliveryStatus::ACTIVE.iter().map(|s| s.as_str()).collect()
}

/// Record store backed by the `notification_records` table.
///
/// Dedup relies on the partial unique index over `request_fingerprint` for
/// active statuses; `insert_if_absent` is a single `ON CONFLICT DO NOTHING`.
pub struct PgRecordStore {
    pool: Arc<DbPool>,
}

impl PgRecordStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

const INSERT_ATTEMPTS: usize = 3;

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert_if_absent(&self, record: NewNotificationRecord) -> Result<InsertOutcome> {
        let mut conn = self.pool.get().await?;
        let row = NewRecordRow::from(&record);

        // The conflicting row can leave the active set between the insert and
        // the lookup, so a lost race is retried a few times.
        for _ in 0..INSERT_ATTEMPTS {
            let inserted: Option<RecordRow> = diesel::insert_into(notification_records::table)
                .values(&row)
                .on_conflict_do_nothing()
                .returning(RecordRow::as_returning())
                .get_result(&mut conn)
                .await
                .optional()?;

            if let Some(inserted) = inserted {
                return Ok(InsertOutcome::Created(inserted.try_into()?));
            }

            let existing: Option<RecordRow> = notification_records::table
                .filter(notification_records::request_fingerprint.eq(&record.request_fingerprint))
                .filter(notification_records::status.eq_any(active_statuses()))
                .select(RecordRow::as_select())
                .first(&mut conn)
                .await
                .optional()?;

            if let Some(existing) = existing {
                return Ok(InsertOutcome::Existing(existing.try_into()?));
            }

            tracing::debug!(
                "Active record for fingerprint {} vanished during insert, retrying",
                record.request_fingerprint
            );
        }

        Err(anyhow!(
            "Could not insert record for fingerprint {} after {} attempts",
            record.request_fingerprint,
            INSERT_ATTEMPTS
        ))
    }

    async fn find_active(&self, fingerprint: &str) -> Result<Option<NotificationRecord>> {
        let mut conn = self.pool.get().await?;

        let row: Option<RecordRow> = notification_records::table
            .filter(notification_records::request_fingerprint.eq(fingerprint))
            .filter(notification_records::status.eq_any(active_statuses()))
            .select(RecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(NotificationRecord::try_from).transpose()
    }

    async fn get(&self, id: i64) -> Result<Option<NotificationRecord>> {
        let mut conn = self.pool.get().await?;

        let row: Option<RecordRow> = notification_records::table
            .find(id)
            .select(RecordRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(NotificationRecord::try_from).transpose()
    }

    async fn transition(
        &self,
        current: &NotificationRecord,
        next: &NotificationRecord,
    ) -> Result<Option<NotificationRecord>> {
        let mut conn = self.pool.get().await?;

        let row: Option<RecordRow> = diesel::update(
            notification_records::table
                .filter(notification_records::id.eq(current.id))
                .filter(notification_records::status.eq(current.status.as_str()))
                .filter(notification_records::updated_at.eq(current.updated_at)),
        )
        .set(RecordChanges::from(next))
        .returning(RecordRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        row.map(NotificationRecord::try_from).transpose()
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<NotificationRecord>> {
        let mut conn = self.pool.get().await?;

        let mut query = notification_records::table.into_boxed();
        if let Some(status) = filter.status {
            query = query.filter(notification_records::status.eq(status.as_str()));
        }
        if let Some(event_type) = filter.event_type {
            query = query.filter(notification_records::event_type.eq(event_type.as_str()));
        }
        if let Some(from) = filter.created_from {
            query = query.filter(notification_records::created_at.ge(from));
        }
        if let Some(to) = filter.created_to {
            query = query.filter(notification_records::created_at.lt(to));
        }

        let rows: Vec<RecordRow> = query
            .order((notification_records::created_at.desc(), notification_records::id.desc()))
            .limit(filter.effective_limit())
            .offset(filter.effective_offset())
            .select(RecordRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(NotificationRecord::try_from).collect()
    }

    async fn due_for_retry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<NotificationRecord>> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<RecordRow> = notification_records::table
            .filter(notification_records::status.eq(DeliveryStatus::Pending.as_str()))
            .filter(notification_records::next_attempt_at.le(now))
            .order((notification_records::next_attempt_at.asc(), notification_records::id.asc()))
            .limit(limit)
            .select(RecordRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(NotificationRecord::try_from).collect()
    }

    async fn requeue_stalled(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.pool.get().await?;

        let cancelled = diesel::update(
            notification_records::table
                .filter(notification_records::status.eq(DeliveryStatus::Sending.as_str()))
                .filter(notification_records::updated_at.lt(cutoff))
                .filter(notification_records::cancel_requested.eq(true)),
        )
        .set((
            notification_records::status.eq(DeliveryStatus::Cancelled.as_str()),
            notification_records::last_error.eq(Some(STALLED_CANCELLED_ERROR)),
            notification_records::next_attempt_at.eq(None::<DateTime<Utc>>),
            notification_records::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;

        let requeued = diesel::update(
            notification_records::table
                .filter(notification_records::status.eq(DeliveryStatus::Sending.as_str()))
                .filter(notification_records::updated_at.lt(cutoff))
                .filter(notification_records::cancel_requested.eq(false)),
        )
        .set((
            notification_records::status.eq(DeliveryStatus::Pending.as_str()),
            notification_records::last_error.eq(Some(STALLED_SEND_ERROR)),
            notification_records::next_attempt_at.eq(Some(now)),
            notification_records::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;

        Ok(cancelled + requeued)
    }

    async fn count_by_status(&self) -> Result<StatusSummary> {
        let mut conn = self.pool.get().await?;

        let counts: Vec<(String, i64)> = notification_records::table
            .group_by(notification_records::status)
            .select((notification_records::status, count_star()))
            .load(&mut conn)
            .await?;

        let counts = counts
            .into_iter()
            .map(|(status, count)| {
                status
                    .parse::<DeliveryStatus>()
                    .map(|s| (s, count))
                    .map_err(|e| anyhow!("{}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StatusSummary::from_counts(counts))
    }
}
