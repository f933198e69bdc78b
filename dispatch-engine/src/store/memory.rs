use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{
    DeliveryStatus, NewNotificationRecord, NotificationRecord, RecordFilter, StatusSummary,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{InsertOutcome, RecordStore, STALLED_CANCELLED_ERROR, STALLED_SEND_ERROR};

#[derive(Default)]
struct State {
    next_id: i64,
    records: BTreeMap<i64, NotificationRecord>,
}

impl State {
    fn active_with(&self, fingerprint: &str) -> Option<&NotificationRecord> {
        self.records
            .values()
            .find(|r| r.request_fingerprint == fingerprint && r.status.is_active())
    }
}

/// Record store kept in process memory.
///
/// A single mutex guards all records, which makes insert-if-absent and
/// compare-and-set transitions atomic. The active-fingerprint uniqueness
/// rule is enforced on transitions too, mirroring the partial unique index
/// of the Postgres schema.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<State>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_if_absent(&self, record: NewNotificationRecord) -> anyhow::Result<InsertOutcome> {
        let mut state = self.state();

        if let Some(existing) = state.active_with(&record.request_fingerprint) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        state.next_id += 1;
        let created = record.into_record(state.next_id);
        state.records.insert(created.id, created.clone());
        Ok(InsertOutcome::Created(created))
    }

    async fn find_active(&self, fingerprint: &str) -> anyhow::Result<Option<NotificationRecord>> {
        Ok(self.state().active_with(fingerprint).cloned())
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<NotificationRecord>> {
        Ok(self.state().records.get(&id).cloned())
    }

    async fn transition(
        &self,
        current: &NotificationRecord,
        next: &NotificationRecord,
    ) -> anyhow::Result<Option<NotificationRecord>> {
        let mut state = self.state();

        let matches = state
            .records
            .get(&current.id)
            .map(|stored| stored.status == current.status && stored.updated_at == current.updated_at)
            .unwrap_or(false);
        if !matches {
            return Ok(None);
        }

        if next.status.is_active() {
            if let Some(other) = state
                .active_with(&next.request_fingerprint)
                .filter(|other| other.id != current.id)
            {
                return Err(anyhow!(
                    "fingerprint {} is already held by active record {}",
                    next.request_fingerprint,
                    other.id
                ));
            }
        }

        let mut stored = next.clone();
        stored.id = current.id;
        state.records.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn list(&self, filter: &RecordFilter) -> anyhow::Result<Vec<NotificationRecord>> {
        let state = self.state();
        let mut matching: Vec<&NotificationRecord> =
            state.records.values().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(filter.effective_offset() as usize)
            .take(filter.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn due_for_retry(&self, now: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<NotificationRecord>> {
        let state = self.state();
        let mut due: Vec<&NotificationRecord> = state
            .records
            .values()
            .filter(|r| r.status == DeliveryStatus::Pending)
            .filter(|r| r.next_attempt_at.map(|at| at <= now).unwrap_or(false))
            .collect();
        due.sort_by_key(|r| (r.next_attempt_at, r.id));

        Ok(due.into_iter().take(limit.max(0) as usize).cloned().collect())
    }

    async fn requeue_stalled(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut state = self.state();
        let mut requeued = 0;

        for record in state.records.values_mut() {
            if record.status != DeliveryStatus::Sending || record.updated_at >= cutoff {
                continue;
            }
            if record.cancel_requested {
                record.status = DeliveryStatus::Cancelled;
                record.last_error = Some(STALLED_CANCELLED_ERROR.to_string());
                record.next_attempt_at = None;
            } else {
                record.status = DeliveryStatus::Pending;
                record.last_error = Some(STALLED_SEND_ERROR.to_string());
                record.next_attempt_at = Some(now);
            }
            record.updated_at = now;
            requeued += 1;
        }

        Ok(requeued)
    }

    async fn count_by_status(&self) -> anyhow::Result<StatusSummary> {
        let state = self.state();
        Ok(StatusSummary::from_counts(
            state.records.values().map(|r| (r.status, 1)),
        ))
    }
}
