use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Entry,
    Exit,
    Late,
    Absent,
    SessionStart,
    SessionBreak,
    SessionResume,
    SessionFinish,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::Entry,
        EventType::Exit,
        EventType::Late,
        EventType::Absent,
        EventType::SessionStart,
        EventType::SessionBreak,
        EventType::SessionResume,
        EventType::SessionFinish,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Entry => "entry",
            EventType::Exit => "exit",
            EventType::Late => "late",
            EventType::Absent => "absent",
            EventType::SessionStart => "session_start",
            EventType::SessionBreak => "session_break",
            EventType::SessionResume => "session_resume",
            EventType::SessionFinish => "session_finish",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "event type",
                value: s.to_string(),
            })
    }
}

/// Lifecycle of a [`NotificationRecord`].
///
/// `Pending -> Sending -> Sent | Failed`, with `Sending -> Pending` for a
/// scheduled retry and `Pending -> Cancelled` on operator request. A
/// `Sending` record only becomes `Cancelled` once its attempt has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 5] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Sending,
        DeliveryStatus::Sent,
        DeliveryStatus::Failed,
        DeliveryStatus::Cancelled,
    ];

    /// Statuses that own their fingerprint: a new request with the same
    /// fingerprint is folded into the existing record.
    pub const ACTIVE: [DeliveryStatus; 3] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Sending,
        DeliveryStatus::Sent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::Failed | DeliveryStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        DeliveryStatus::ACTIVE.contains(self)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "delivery status",
                value: s.to_string(),
            })
    }
}

/// Variants are declared in notification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    PrimaryGuardian,
    SecondaryGuardian,
    SubjectSelf,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::PrimaryGuardian => "primary_guardian",
            ContactType::SecondaryGuardian => "secondary_guardian",
            ContactType::SubjectSelf => "subject_self",
        }
    }
}

impl fmt::Display for ContactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_guardian" => Ok(ContactType::PrimaryGuardian),
            "secondary_guardian" => Ok(ContactType::SecondaryGuardian),
            "subject_self" => Ok(ContactType::SubjectSelf),
            other => Err(UnknownVariant {
                kind: "contact type",
                value: other.to_string(),
            }),
        }
    }
}

/// An intent to notify one recipient about one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Caller-supplied idempotency key; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    pub recipient_phone: String,
    #[serde(default)]
    pub recipient_name: Option<String>,
    pub event_type: EventType,
    pub subject_id: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Literal message that bypasses template lookup.
    #[serde(default)]
    pub template_override: Option<String>,
}

impl NotificationRequest {
    pub fn new(recipient_phone: impl Into<String>, event_type: EventType, subject_id: impl Into<String>) -> Self {
        Self {
            request_id: None,
            recipient_phone: recipient_phone.into(),
            recipient_name: None,
            event_type,
            subject_id: subject_id.into(),
            variables: HashMap::new(),
            template_override: None,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// The persisted, auditable lineage of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub request_id: String,
    pub request_fingerprint: String,
    pub normalized_phone: String,
    pub recipient_name: Option<String>,
    pub event_type: EventType,
    pub subject_id: String,
    pub rendered_message: String,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub gateway_response_raw: Option<String>,
    /// Set when `cancel` hits a record mid-send; the attempt in flight
    /// decides between `Sent` and `Cancelled`.
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A record before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotificationRecord {
    pub request_id: String,
    pub request_fingerprint: String,
    pub normalized_phone: String,
    pub recipient_name: Option<String>,
    pub event_type: EventType,
    pub subject_id: String,
    pub rendered_message: String,
    pub created_at: DateTime<Utc>,
}

impl NewNotificationRecord {
    /// Materializes the record as a freshly created `Pending` row.
    pub fn into_record(self, id: i64) -> NotificationRecord {
        NotificationRecord {
            id,
            request_id: self.request_id,
            request_fingerprint: self.request_fingerprint,
            normalized_phone: self.normalized_phone,
            recipient_name: self.recipient_name,
            event_type: self.event_type,
            subject_id: self.subject_id,
            rendered_message: self.rendered_message,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_error: None,
            provider_message_id: None,
            gateway_response_raw: None,
            cancel_requested: false,
            created_at: self.created_at,
            last_attempt_at: None,
            next_attempt_at: Some(self.created_at),
            updated_at: self.created_at,
        }
    }
}

/// Cached connectivity snapshot published by the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayHealthStatus {
    pub connected: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub quota_remaining: Option<i64>,
    pub check_interval_seconds: u64,
}

impl GatewayHealthStatus {
    /// Status before the first check: disconnected and stale.
    pub fn unknown(check_interval_seconds: u64) -> Self {
        Self {
            connected: false,
            last_checked_at: None,
            last_error: None,
            quota_remaining: None,
            check_interval_seconds,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        // Intervals too large for chrono never go stale.
        let interval = i64::try_from(self.check_interval_seconds)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        self.last_checked_at
            .map(|checked| now.signed_duration_since(checked) < interval)
            .unwrap_or(false)
    }

    /// True when the gateway is known to be down and the knowledge is recent.
    pub fn is_known_down(&self, now: DateTime<Utc>) -> bool {
        !self.connected && self.is_fresh(now)
    }
}

/// A notification target tied to a subject (student).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub subject_id: String,
    pub phone_raw: String,
    #[serde(default)]
    pub name: Option<String>,
    pub contact_type: ContactType,
    pub active: bool,
    pub receive_notifications: bool,
}

impl Contact {
    pub fn is_eligible(&self) -> bool {
        self.active && self.receive_notifications
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub created_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl RecordFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn matches(&self, record: &NotificationRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.event_type.map_or(true, |e| record.event_type == e)
            && self.created_from.map_or(true, |from| record.created_at >= from)
            && self.created_to.map_or(true, |to| record.created_at < to)
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusSummary {
    pub fn from_counts(counts: impl IntoIterator<Item = (DeliveryStatus, i64)>) -> Self {
        let mut summary = StatusSummary::default();
        for (status, count) in counts {
            match status {
                DeliveryStatus::Pending => summary.pending += count,
                DeliveryStatus::Sending => summary.sending += count,
                DeliveryStatus::Sent => summary.sent += count,
                DeliveryStatus::Failed => summary.failed += count,
                DeliveryStatus::Cancelled => summary.cancelled += count,
            }
        }
        summary
    }

    pub fn total(&self) -> i64 {
        self.pending + self.sending + self.sent + self.failed + self.cancelled
    }
}
