use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::phone::NormalizedPhone;
use crate::types::EventType;

/// Index of the fixed-width time bucket `at` falls into.
pub fn time_bucket(at: DateTime<Utc>, width: Duration) -> i64 {
    let width = width.as_secs().max(1) as i64;
    at.timestamp().div_euclid(width)
}

/// Hash key used to collapse near-simultaneous duplicate triggers for the same
/// recipient, event and subject.
pub fn request_fingerprint(
    phone: &NormalizedPhone,
    event_type: EventType,
    subject_id: &str,
    at: DateTime<Utc>,
    bucket_width: Duration,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phone.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(subject_id.as_bytes());
    hasher.update(b"|");
    hasher.update(time_bucket(at, bucket_width).to_string().as_bytes());
    hex::encode(hasher.finalize())
}
