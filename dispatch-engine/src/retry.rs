//! Retry policy and the per-attempt state transition.

use chrono::{DateTime, Utc};
use dispatch_core::config::DispatchConfig;
use dispatch_core::{DeliveryStatus, NotificationRecord};
use dispatch_gateway::{GatewayResult, SendOutcome};
use std::time::Duration;

/// How the engine treats the outcome of one gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    Delivered,
    /// Worth retrying: transport failures and unrecognised gateway errors.
    Transient,
    /// Retrying will not help, e.g. an unregistered number.
    Permanent,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    permanent_patterns: Vec<String>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, permanent_patterns: Vec<String>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            permanent_patterns: permanent_patterns
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay(),
            config.max_delay(),
            config.permanent_failure_patterns.clone(),
        )
    }

    /// Delay before the attempt following attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_permanent(&self, error_message: &str) -> bool {
        let message = error_message.to_lowercase();
        self.permanent_patterns.iter().any(|p| message.contains(p.as_str()))
    }

    /// Only gateway-reported failures can be permanent; transport failures
    /// always retry.
    pub fn classify(&self, result: &GatewayResult) -> AttemptClass {
        match result.outcome {
            SendOutcome::Delivered => AttemptClass::Delivered,
            SendOutcome::TransportFailure => AttemptClass::Transient,
            SendOutcome::Rejected => match result.error_message.as_deref() {
                Some(message) if self.is_permanent(message) => AttemptClass::Permanent,
                _ => AttemptClass::Transient,
            },
        }
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}

/// The record after one completed gateway call on a `Sending` record.
///
/// A pending cancel request wins over any further attempt: a delivered
/// message still ends `Sent`, every other outcome ends `Cancelled`.
pub fn apply_attempt(
    policy: &RetryPolicy,
    record: &NotificationRecord,
    result: &GatewayResult,
    now: DateTime<Utc>,
) -> NotificationRecord {
    let mut next = record.clone();
    next.attempt_count += 1;
    next.last_attempt_at = Some(now);
    next.updated_at = now;
    if !result.raw_response.is_empty() {
        next.gateway_response_raw = Some(result.raw_response.clone());
    }

    let error = result
        .error_message
        .clone()
        .unwrap_or_else(|| "gateway send failed".to_string());

    match policy.classify(result) {
        AttemptClass::Delivered => {
            next.status = DeliveryStatus::Sent;
            next.provider_message_id = result.provider_message_id.clone();
            next.last_error = None;
            next.next_attempt_at = None;
        }
        _ if record.cancel_requested => {
            next.status = DeliveryStatus::Cancelled;
            next.last_error = Some(error);
            next.next_attempt_at = None;
        }
        AttemptClass::Permanent => {
            next.status = DeliveryStatus::Failed;
            next.last_error = Some(error);
            next.next_attempt_at = None;
        }
        AttemptClass::Transient if (next.attempt_count as u32) < policy.max_attempts => {
            let delay = policy.backoff(next.attempt_count as u32);
            next.status = DeliveryStatus::Pending;
            next.last_error = Some(error);
            next.next_attempt_at = Some(now + chrono_delay(delay));
        }
        AttemptClass::Transient => {
            next.status = DeliveryStatus::Failed;
            next.last_error = Some(error);
            next.next_attempt_at = None;
        }
    }

    next
}

/// Pushes a pending record back without spending an attempt, used while
/// the gateway is known to be down.
pub fn defer(
    policy: &RetryPolicy,
    record: &NotificationRecord,
    reason: &str,
    now: DateTime<Utc>,
) -> NotificationRecord {
    let mut next = record.clone();
    next.status = DeliveryStatus::Pending;
    next.last_error = Some(reason.to_string());
    next.next_attempt_at = Some(now + chrono_delay(policy.base_delay));
    next.updated_at = now;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::{EventType, NewNotificationRecord};
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_secs(5),
            Duration::from_secs(300),
            vec!["invalid number".to_string(), "Not Registered".to_string()],
        )
    }

    fn sending_record() -> NotificationRecord {
        let mut record = NewNotificationRecord {
            request_id: "req-1".to_string(),
            request_fingerprint: "fp".to_string(),
            normalized_phone: "6281234567890".to_string(),
            recipient_name: None,
            event_type: EventType::Entry,
            subject_id: "s-1".to_string(),
            rendered_message: "hello".to_string(),
            created_at: Utc::now(),
        }
        .into_record(1);
        record.status = DeliveryStatus::Sending;
        record
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        assert_eq!(policy.backoff(10), Duration::from_secs(300));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn classification_follows_outcome_and_patterns() {
        let policy = policy();
        assert_eq!(policy.classify(&GatewayResult::delivered(None, "{}")), AttemptClass::Delivered);
        assert_eq!(
            policy.classify(&GatewayResult::rejected("Invalid Number format", "")),
            AttemptClass::Permanent
        );
        assert_eq!(
            policy.classify(&GatewayResult::rejected("phone not registered", "")),
            AttemptClass::Permanent
        );
        assert_eq!(
            policy.classify(&GatewayResult::rejected("device busy", "")),
            AttemptClass::Transient
        );
        // A transport error never counts as permanent, whatever it says.
        assert_eq!(
            policy.classify(&GatewayResult::transport_failure("invalid number", "")),
            AttemptClass::Transient
        );
    }

    #[test]
    fn transient_failure_schedules_retry() {
        let now = Utc::now();
        let next = apply_attempt(
            &policy(),
            &sending_record(),
            &GatewayResult::transport_failure("timeout", ""),
            now,
        );
        assert_eq!(next.status, DeliveryStatus::Pending);
        assert_eq!(next.attempt_count, 1);
        assert_eq!(next.next_attempt_at, Some(now + chrono::Duration::seconds(5)));
        assert_eq!(next.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn success_clears_error_and_keeps_provider_id() {
        let mut record = sending_record();
        record.attempt_count = 1;
        record.last_error = Some("timeout".to_string());

        let next = apply_attempt(
            &policy(),
            &record,
            &GatewayResult::delivered(Some("msg-9".to_string()), r#"{"status":true}"#),
            Utc::now(),
        );
        assert_eq!(next.status, DeliveryStatus::Sent);
        assert_eq!(next.attempt_count, 2);
        assert_eq!(next.provider_message_id.as_deref(), Some("msg-9"));
        assert!(next.last_error.is_none());
        assert!(next.next_attempt_at.is_none());
    }

    #[test]
    fn cancel_request_is_honoured_once_the_attempt_resolves() {
        let mut record = sending_record();
        record.cancel_requested = true;
        let now = Utc::now();

        let failed = apply_attempt(
            &policy(),
            &record,
            &GatewayResult::transport_failure("timeout", ""),
            now,
        );
        assert_eq!(failed.status, DeliveryStatus::Cancelled);
        assert_eq!(failed.attempt_count, 1);
        assert!(failed.next_attempt_at.is_none());

        let delivered = apply_attempt(
            &policy(),
            &record,
            &GatewayResult::delivered(Some("m-1".to_string()), "{}"),
            now,
        );
        assert_eq!(delivered.status, DeliveryStatus::Sent);
        assert_eq!(delivered.provider_message_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn deferral_does_not_spend_an_attempt() {
        let mut record = sending_record();
        record.status = DeliveryStatus::Pending;
        let now = Utc::now();
        let next = defer(&policy(), &record, "gateway unavailable", now);
        assert_eq!(next.attempt_count, 0);
        assert_eq!(next.status, DeliveryStatus::Pending);
        assert_eq!(next.next_attempt_at, Some(now + chrono::Duration::seconds(5)));
    }

    proptest! {
        #[test]
        fn attempts_never_exceed_cap(
            max_attempts in 1u32..6,
            outcomes in proptest::collection::vec(0u8..3, 1..20),
        ) {
            let policy = RetryPolicy::new(
                max_attempts,
                Duration::ZERO,
                Duration::ZERO,
                vec!["invalid number".to_string()],
            );
            let mut record = sending_record();

            for outcome in outcomes {
                if record.status != DeliveryStatus::Sending {
                    break;
                }
                let result = match outcome {
                    0 => GatewayResult::transport_failure("timeout", ""),
                    1 => GatewayResult::rejected("invalid number", ""),
                    _ => GatewayResult::rejected("device busy", ""),
                };
                record = apply_attempt(&policy, &record, &result, Utc::now());
                prop_assert!(record.attempt_count as u32 <= max_attempts);
                if record.status == DeliveryStatus::Pending {
                    record.status = DeliveryStatus::Sending;
                }
            }

            if record.status == DeliveryStatus::Failed {
                let permanent = record.last_error.as_deref() == Some("invalid number");
                prop_assert!(permanent || record.attempt_count as u32 == max_attempts);
            }
        }
    }
}
