//! Persistence of notification records.
//!
//! The store is the single source of truth for record state. Every mutation
//! after creation goes through [`RecordStore::transition`], an optimistic
//! compare-and-set keyed on the record's `status` and `updated_at`, so two
//! workers can never both claim the same pending record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{NewNotificationRecord, NotificationRecord, RecordFilter, StatusSummary};

pub mod memory;
pub mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// Result of an insert-if-no-active-fingerprint-exists.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(NotificationRecord),
    /// A pending, sending or sent record already holds the fingerprint.
    Existing(NotificationRecord),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomically creates a `Pending` record unless an active record with the
    /// same fingerprint exists.
    async fn insert_if_absent(&self, record: NewNotificationRecord) -> anyhow::Result<InsertOutcome>;

    async fn find_active(&self, fingerprint: &str) -> anyhow::Result<Option<NotificationRecord>>;

    async fn get(&self, id: i64) -> anyhow::Result<Option<NotificationRecord>>;

    /// Replaces `current` with `next` if the stored row still matches
    /// `current`'s status and `updated_at`. Returns the stored row, or `None`
    /// when another writer got there first.
    async fn transition(
        &self,
        current: &NotificationRecord,
        next: &NotificationRecord,
    ) -> anyhow::Result<Option<NotificationRecord>>;

    /// Newest first.
    async fn list(&self, filter: &RecordFilter) -> anyhow::Result<Vec<NotificationRecord>>;

    /// Pending records whose `next_attempt_at` has passed, oldest due first.
    async fn due_for_retry(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<NotificationRecord>>;

    /// Moves records stuck in `Sending` since before `cutoff` back to
    /// `Pending`, or to `Cancelled` when a cancel was requested meanwhile.
    async fn requeue_stalled(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> anyhow::Result<usize>;

    async fn count_by_status(&self) -> anyhow::Result<StatusSummary>;
}

pub(crate) const STALLED_SEND_ERROR: &str = "send attempt interrupted; requeued";
pub(crate) const STALLED_CANCELLED_ERROR: &str = "send attempt interrupted; cancelled";
