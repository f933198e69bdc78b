use chrono::Utc;
use dispatch_core::config::{DispatchConfig, HealthConfig, PhoneConfig};
use dispatch_core::{
    DeliveryStatus, DispatchError, EventType, MemoryTemplateStore, NotificationRecord,
    NotificationRequest, RecordFilter, TemplateRenderer,
};
use dispatch_engine::{DispatchEngine, HealthMonitor, MemoryRecordStore, RecordStore};
use dispatch_gateway::{GatewayResult, ScriptedGateway};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: DispatchEngine,
    gateway: Arc<ScriptedGateway>,
    store: Arc<MemoryRecordStore>,
}

fn test_config() -> DispatchConfig {
    DispatchConfig {
        // One bucket per day keeps back-to-back calls in the same window.
        dedup_bucket_secs: 86_400,
        base_delay_ms: 0,
        max_delay_secs: 0,
        bulk_delay_ms: 0,
        ..Default::default()
    }
}

async fn harness_with(config: DispatchConfig) -> Harness {
    let templates = Arc::new(MemoryTemplateStore::new());
    templates
        .insert(EventType::Entry, "id", "{student_name} tiba pukul {time} ({date})", 10)
        .await;
    templates
        .insert(EventType::Exit, "id", "Halo {recipient_name}, {student_name} pulang pukul {time}", 10)
        .await;

    let gateway = Arc::new(ScriptedGateway::new());
    let store = Arc::new(MemoryRecordStore::new());
    let health = HealthMonitor::new(gateway.clone(), HealthConfig::default());

    let engine = DispatchEngine::new(
        config,
        PhoneConfig::default(),
        TemplateRenderer::new(templates),
        store.clone(),
        gateway.clone(),
        health,
    );

    Harness { engine, gateway, store }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

fn entry_request(phone: &str, subject: &str) -> NotificationRequest {
    NotificationRequest::new(phone, EventType::Entry, subject)
        .with_variable("student_name", "Ani")
        .with_variable("time", "07:05")
        .with_variable("date", "2025-01-10")
}

async fn wait_for_status(engine: &DispatchEngine, status: DeliveryStatus) -> NotificationRecord {
    for _ in 0..200 {
        let filter = RecordFilter {
            status: Some(status),
            ..Default::default()
        };
        if let Some(record) = engine.list_records(&filter).await.unwrap().into_iter().next() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no record reached {}", status);
}

#[tokio::test]
async fn happy_path_is_sent_on_first_attempt() {
    let h = harness().await;

    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();

    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.normalized_phone, "6281234567890");
    assert_eq!(record.rendered_message, "Ani tiba pukul 07:05 (2025-01-10)");
    assert!(record.provider_message_id.is_some());
    assert!(record.last_attempt_at.is_some());

    let sent = h.gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].phone, "6281234567890");
}

#[tokio::test]
async fn transient_failure_then_success() {
    let h = harness().await;
    h.gateway.push_transport_failure("request timed out");

    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Pending);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("request timed out"));

    assert_eq!(h.engine.process_due_retries().await.unwrap(), 1);

    let record = h.engine.get_record(record.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 2);
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn permanent_failure_does_not_retry() {
    let h = harness().await;
    h.gateway.push_rejection("invalid number");

    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("invalid number"));

    assert_eq!(h.engine.process_due_retries().await.unwrap(), 0);
    assert_eq!(h.gateway.send_count(), 1);
}

#[tokio::test]
async fn transient_failures_exhaust_the_retry_budget() {
    let h = harness().await;
    h.gateway
        .push_transport_failure("timeout")
        .push_transport_failure("timeout")
        .push_transport_failure("timeout");

    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    h.engine.process_due_retries().await.unwrap();
    h.engine.process_due_retries().await.unwrap();
    assert_eq!(h.engine.process_due_retries().await.unwrap(), 0);

    let record = h.engine.get_record(record.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(h.gateway.send_count(), 3);
}

#[tokio::test]
async fn known_down_gateway_defers_without_sending() {
    let h = harness().await;
    h.gateway.set_connected(false);

    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Pending);
    assert_eq!(record.attempt_count, 0);
    assert!(record
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("gateway unavailable"));
    assert_eq!(h.gateway.send_count(), 0);

    // Still down and the cached status is fresh: no check, no send.
    h.engine.process_due_retries().await.unwrap();
    assert_eq!(h.gateway.send_count(), 0);
    assert_eq!(h.gateway.status_check_count(), 1);

    h.gateway.set_connected(true);
    h.engine.health().check_now().await;
    h.engine.process_due_retries().await.unwrap();

    let record = h.engine.get_record(record.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn missing_template_is_rejected_without_a_record() {
    let h = harness().await;

    let err = h
        .engine
        .dispatch(NotificationRequest::new("081234567890", EventType::Custom, "s-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::TemplateNotFound { .. }));
    assert!(h.store.is_empty());
    assert_eq!(h.gateway.send_count(), 0);
}

#[tokio::test]
async fn template_override_is_sent_verbatim() {
    let h = harness().await;
    let mut request = NotificationRequest::new("081234567890", EventType::Custom, "s-1");
    request.template_override = Some("Sekolah libur besok {date}".to_string());

    let record = h.engine.dispatch(request).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.rendered_message, "Sekolah libur besok {date}");
}

#[tokio::test]
async fn invalid_phone_is_rejected_without_a_record() {
    let h = harness().await;

    let err = h.engine.dispatch(entry_request("12-34", "s-1")).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_phone");
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn recipient_name_is_available_to_templates() {
    let h = harness().await;
    let mut request = NotificationRequest::new("081234567890", EventType::Exit, "s-1")
        .with_variable("student_name", "Ani")
        .with_variable("time", "14:00")
        .with_variable("date", "2025-01-10");
    request.recipient_name = Some("Bu Siti".to_string());

    let record = h.engine.dispatch(request).await.unwrap();
    assert_eq!(record.rendered_message, "Halo Bu Siti, Ani pulang pukul 14:00");
    assert_eq!(record.recipient_name.as_deref(), Some("Bu Siti"));
}

#[tokio::test]
async fn duplicate_in_same_bucket_returns_same_record() {
    let h = harness().await;

    let first = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    let second = h.engine.dispatch(entry_request("+62 812-3456-7890", "s-1")).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.gateway.send_count(), 1);
}

#[tokio::test]
async fn concurrent_duplicates_collapse_to_one_record() {
    let h = harness().await;

    let calls = (0..8).map(|_| h.engine.dispatch(entry_request("081234567890", "s-1")));
    let records: Vec<NotificationRecord> = join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(records.iter().all(|r| r.id == records[0].id));
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.gateway.send_count(), 1);
}

#[tokio::test]
async fn different_subject_is_not_a_duplicate() {
    let h = harness().await;

    let first = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    let second = h.engine.dispatch(entry_request("081234567890", "s-2")).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(h.gateway.send_count(), 2);
}

#[tokio::test]
async fn failed_record_does_not_block_a_fresh_dispatch() {
    let h = harness().await;
    h.gateway.push_rejection("invalid number");

    let failed = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);

    let fresh = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    assert_ne!(fresh.id, failed.id);
    assert_eq!(fresh.status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn bulk_items_are_independent_and_ordered() {
    let h = harness().await;
    h.gateway
        .push_send(GatewayResult::delivered(Some("m-1".to_string()), "{}"))
        .push_rejection("invalid number");

    let results = h
        .engine
        .send_bulk(
            vec![
                entry_request("081100000001", "s-1"),
                entry_request("081100000002", "s-2"),
                entry_request("abc", "s-3"),
                entry_request("081100000004", "s-4"),
            ],
            Duration::ZERO,
        )
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].as_ref().unwrap().status, DeliveryStatus::Sent);
    assert_eq!(results[1].as_ref().unwrap().status, DeliveryStatus::Failed);
    assert!(matches!(results[2], Err(DispatchError::InvalidPhone { .. })));
    assert_eq!(results[3].as_ref().unwrap().status, DeliveryStatus::Sent);

    let phones: Vec<String> = h.gateway.sent().into_iter().map(|m| m.phone).collect();
    assert_eq!(phones, vec!["6281100000001", "6281100000002", "6281100000004"]);
}

#[tokio::test]
async fn bulk_pauses_between_sends() {
    let h = harness().await;
    let started = std::time::Instant::now();

    let results = h
        .engine
        .send_bulk(
            vec![
                entry_request("081100000001", "s-1"),
                entry_request("081100000002", "s-2"),
                entry_request("081100000003", "s-3"),
            ],
            Duration::from_millis(40),
        )
        .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn failed_record_can_be_retried_manually() {
    let h = harness().await;
    h.gateway.push_rejection("invalid number");

    let failed = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    let requeued = h.engine.retry(failed.id).await.unwrap();
    assert_eq!(requeued.status, DeliveryStatus::Pending);
    assert_eq!(requeued.attempt_count, 0);

    assert_eq!(h.engine.process_due_retries().await.unwrap(), 1);
    let record = h.engine.get_record(failed.id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test]
async fn only_failed_records_are_retryable() {
    let h = harness().await;
    let sent = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();

    let err = h.engine.retry(sent.id).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::NotRetryable {
            status: DeliveryStatus::Sent,
            ..
        }
    ));

    let err = h.engine.retry(9_999).await.unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(9_999)));
}

#[tokio::test]
async fn retry_failed_sweeps_matching_records() {
    let h = harness().await;
    h.gateway
        .push_rejection("invalid number")
        .push_rejection("invalid number");

    h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    h.engine.dispatch(entry_request("081234567890", "s-2")).await.unwrap();
    h.engine.dispatch(entry_request("081234567890", "s-3")).await.unwrap();

    let requeued = h.engine.retry_failed(&RecordFilter::default()).await.unwrap();
    assert_eq!(requeued.len(), 2);
    assert!(requeued.iter().all(|r| r.status == DeliveryStatus::Pending));

    let summary = h.engine.status_summary().await.unwrap();
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn retry_failed_reaches_past_one_page() {
    let h = harness().await;
    let total = RecordFilter::MAX_LIMIT as usize + 10;
    for _ in 0..total {
        h.gateway.push_rejection("invalid number");
    }
    for i in 0..total {
        let record = h
            .engine
            .dispatch(entry_request("081234567890", &format!("s-{}", i)))
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
    }

    // s-0 is sent again, so its failed record can no longer be re-queued.
    let resent = h.engine.dispatch(entry_request("081234567890", "s-0")).await.unwrap();
    assert_eq!(resent.status, DeliveryStatus::Sent);

    let requeued = h.engine.retry_failed(&RecordFilter::default()).await.unwrap();
    assert_eq!(requeued.len(), total - 1);

    let summary = h.engine.status_summary().await.unwrap();
    assert_eq!(summary.pending as usize, total - 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.sent, 1);
}

#[tokio::test]
async fn pending_record_can_be_cancelled_once() {
    let h = harness().await;
    h.gateway.set_connected(false);

    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    let cancelled = h.engine.cancel(record.id).await.unwrap();
    assert_eq!(cancelled.status, DeliveryStatus::Cancelled);
    assert!(cancelled.next_attempt_at.is_none());

    let err = h.engine.cancel(record.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyTerminal { .. }));

    h.gateway.set_connected(true);
    h.engine.health().check_now().await;
    assert_eq!(h.engine.process_due_retries().await.unwrap(), 0);
    assert_eq!(h.gateway.send_count(), 0);
}

#[tokio::test]
async fn sent_record_cannot_be_cancelled() {
    let h = harness().await;
    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();

    let err = h.engine.cancel(record.id).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::AlreadyTerminal {
            status: DeliveryStatus::Sent,
            ..
        }
    ));
}

#[tokio::test]
async fn cancel_during_failed_attempt_prevents_retry() {
    let h = harness().await;
    h.gateway.set_send_delay(Duration::from_millis(150));
    h.gateway.push_transport_failure("timeout");

    let engine = h.engine.clone();
    let in_flight =
        tokio::spawn(async move { engine.dispatch(entry_request("081234567890", "s-1")).await });

    let sending = wait_for_status(&h.engine, DeliveryStatus::Sending).await;
    let requested = h.engine.cancel(sending.id).await.unwrap();
    assert_eq!(requested.status, DeliveryStatus::Sending);
    assert!(requested.cancel_requested);

    // Asking again while the attempt is still out changes nothing.
    let again = h.engine.cancel(sending.id).await.unwrap();
    assert_eq!(again.updated_at, requested.updated_at);

    let settled = in_flight.await.unwrap().unwrap();
    assert_eq!(settled.status, DeliveryStatus::Cancelled);
    assert_eq!(settled.attempt_count, 1);
    assert_eq!(settled.last_error.as_deref(), Some("timeout"));

    assert_eq!(h.engine.process_due_retries().await.unwrap(), 0);
    assert_eq!(h.gateway.send_count(), 1);
}

#[tokio::test]
async fn cancelled_send_keeps_its_fingerprint_until_the_attempt_resolves() {
    let h = harness().await;
    h.gateway.set_send_delay(Duration::from_millis(150));

    let engine = h.engine.clone();
    let in_flight =
        tokio::spawn(async move { engine.dispatch(entry_request("081234567890", "s-1")).await });

    let sending = wait_for_status(&h.engine, DeliveryStatus::Sending).await;
    let requested = h.engine.cancel(sending.id).await.unwrap();
    assert_ne!(requested.status, DeliveryStatus::Cancelled);

    // The same request inside the window is still a duplicate of the in-flight record.
    let duplicate = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    assert_eq!(duplicate.id, sending.id);

    let settled = in_flight.await.unwrap().unwrap();
    assert_eq!(settled.id, sending.id);
    assert_eq!(settled.status, DeliveryStatus::Sent);
    assert_eq!(settled.attempt_count, 1);
    assert!(settled.provider_message_id.is_some());
    assert!(settled.gateway_response_raw.is_some());

    assert_eq!(h.gateway.send_count(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn stalled_send_is_recovered_and_delivered() {
    let h = harness().await;
    let record = h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);

    // A second record left in Sending by a crashed worker.
    h.gateway.set_connected(false);
    h.engine.health().check_now().await;
    let pending = h.engine.dispatch(entry_request("081234567890", "s-2")).await.unwrap();
    let mut stuck = pending.clone();
    stuck.status = DeliveryStatus::Sending;
    stuck.updated_at = Utc::now() - chrono::Duration::minutes(10);
    h.store.transition(&pending, &stuck).await.unwrap().unwrap();

    assert_eq!(h.engine.recover_stalled().await.unwrap(), 1);

    h.gateway.set_connected(true);
    h.engine.health().check_now().await;
    h.engine.process_due_retries().await.unwrap();

    let recovered = h.engine.get_record(pending.id).await.unwrap();
    assert_eq!(recovered.status, DeliveryStatus::Sent);
    assert_eq!(recovered.attempt_count, 1);
}

#[tokio::test]
async fn records_are_filtered_by_status_and_event() {
    let h = harness().await;
    h.gateway.push_rejection("blocked by recipient");

    h.engine.dispatch(entry_request("081234567890", "s-1")).await.unwrap();
    h.engine.dispatch(entry_request("081234567890", "s-2")).await.unwrap();

    let failed = h
        .engine
        .list_records(&RecordFilter {
            status: Some(DeliveryStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].subject_id, "s-1");

    let exits = h
        .engine
        .list_records(&RecordFilter {
            event_type: Some(EventType::Exit),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(exits.is_empty());
}

#[tokio::test]
async fn concurrency_limit_allows_parallel_distinct_sends() {
    let h = harness_with(DispatchConfig {
        max_concurrent_sends: 4,
        ..test_config()
    })
    .await;
    h.gateway.set_send_delay(Duration::from_millis(50));

    let started = std::time::Instant::now();
    let calls = (0..4).map(|i| h.engine.dispatch(entry_request("081234567890", &format!("s-{}", i))));
    let records = join_all(calls).await;

    assert!(records.iter().all(|r| r.as_ref().unwrap().status == DeliveryStatus::Sent));
    assert!(started.elapsed() < Duration::from_millis(190));
}
