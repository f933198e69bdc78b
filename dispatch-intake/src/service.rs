use dispatch_core::template::validate_required;
use dispatch_core::{
    Contact, ContactResolver, DispatchError, DispatchResult, EventType, NotificationRequest,
};
use dispatch_engine::DispatchEngine;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing;

/// A domain event (attendance scan, session change) that should notify a
/// subject's contacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(default, alias = "eventId")]
    pub event_id: Option<String>,
    #[serde(alias = "eventType")]
    pub event_type: EventType,
    #[serde(alias = "subjectId")]
    pub subject_id: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, alias = "templateOverride")]
    pub template_override: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeTally {
    pub contacts: usize,
    pub dispatched: usize,
    pub rejected: usize,
}

/// What the consumer does with a message once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// Processed; commit the offset.
    Handled,
    /// Unparseable or rejected by validation. Redelivery cannot fix it, so
    /// the offset is committed too.
    Skipped,
    /// Storage failed; leave the offset uncommitted and process again.
    Retry,
}

impl PayloadOutcome {
    pub fn should_commit(self) -> bool {
        !matches!(self, PayloadOutcome::Retry)
    }
}

pub struct NotificationIntake {
    resolver: ContactResolver,
    engine: DispatchEngine,
}

impl NotificationIntake {
    pub fn new(resolver: ContactResolver, engine: DispatchEngine) -> Self {
        Self { resolver, engine }
    }

    /// Fans an event out to every eligible contact of its subject.
    ///
    /// Missing required variables reject the whole event before any contact
    /// is looked up. A rejected contact does not stop the others.
    pub async fn handle_event(&self, event: &NotificationEvent) -> DispatchResult<IntakeTally> {
        tracing::debug!(
            "Processing {} event for subject {}",
            event.event_type,
            event.subject_id
        );

        if event.template_override.is_none() {
            validate_required(event.event_type, &event.variables)?;
        }

        let mut tally = IntakeTally::default();
        let mut contacts = self
            .resolver
            .resolve_contacts(&event.subject_id, event.event_type);

        while let Some(contact) = contacts.try_next().await.map_err(DispatchError::Storage)? {
            tally.contacts += 1;
            let request = build_request(event, &contact);

            match self.engine.dispatch(request).await {
                Ok(record) => {
                    tally.dispatched += 1;
                    tracing::debug!(
                        "Contact {} of subject {}: record {} is {}",
                        contact.contact_type.as_str(),
                        event.subject_id,
                        record.id,
                        record.status
                    );
                }
                Err(DispatchError::Storage(e)) => return Err(DispatchError::Storage(e)),
                Err(e) => {
                    tally.rejected += 1;
                    tracing::warn!(
                        "Notification for subject {} ({}) rejected: {}",
                        event.subject_id,
                        event.event_type,
                        e
                    );
                }
            }
        }

        if tally.contacts == 0 {
            tracing::info!(
                "No eligible contacts for subject {} ({}), nothing to send",
                event.subject_id,
                event.event_type
            );
        } else {
            tracing::info!(
                "{} event for subject {}: {} dispatched, {} rejected",
                event.event_type,
                event.subject_id,
                tally.dispatched,
                tally.rejected
            );
        }

        Ok(tally)
    }
}

impl NotificationIntake {
    /// Parses and handles one raw payload, classifying the result for the
    /// consumer's commit decision.
    pub async fn handle_payload(&self, payload: &[u8]) -> PayloadOutcome {
        let event = match parse_event(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping malformed notification event: {}", e);
                return PayloadOutcome::Skipped;
            }
        };

        match self.handle_event(&event).await {
            Ok(_) => PayloadOutcome::Handled,
            Err(DispatchError::Storage(e)) => {
                tracing::error!(
                    "Storage error handling {} event for subject {}: {:#}",
                    event.event_type,
                    event.subject_id,
                    e
                );
                PayloadOutcome::Retry
            }
            Err(e) => {
                tracing::warn!(
                    "Dropping {} event for subject {}: {}",
                    event.event_type,
                    event.subject_id,
                    e
                );
                PayloadOutcome::Skipped
            }
        }
    }
}

fn build_request(event: &NotificationEvent, contact: &Contact) -> NotificationRequest {
    NotificationRequest {
        request_id: event
            .event_id
            .as_ref()
            .map(|id| format!("{}:{}", id, contact.phone_raw)),
        recipient_phone: contact.phone_raw.clone(),
        recipient_name: contact.name.clone(),
        event_type: event.event_type,
        subject_id: event.subject_id.clone(),
        variables: event.variables.clone(),
        template_override: event.template_override.clone(),
    }
}

/// Parses a raw event payload.
pub fn parse_event(payload: &[u8]) -> anyhow::Result<NotificationEvent> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::config::{DispatchConfig, HealthConfig, PhoneConfig};
    use async_trait::async_trait;
    use dispatch_core::{
        ContactStore, ContactType, DeliveryStatus, MemoryContactStore, MemoryTemplateStore,
        RecordFilter, TemplateRenderer,
    };
    use dispatch_engine::{HealthMonitor, MemoryRecordStore};
    use dispatch_gateway::ScriptedGateway;
    use std::sync::Arc;

    struct Fixture {
        intake: NotificationIntake,
        engine: DispatchEngine,
        contacts: Arc<MemoryContactStore>,
        gateway: Arc<ScriptedGateway>,
    }

    struct UnreachableContacts;

    #[async_trait]
    impl ContactStore for UnreachableContacts {
        async fn contacts_for_subject(&self, _subject_id: &str) -> anyhow::Result<Vec<Contact>> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    async fn fixture() -> Fixture {
        let templates = Arc::new(MemoryTemplateStore::new());
        templates
            .insert(EventType::Entry, "id", "Halo {recipient_name}, {student_name} tiba {time}", 10)
            .await;
        templates
            .insert(EventType::SessionStart, "id", "{session_name} dimulai {time}", 10)
            .await;

        let gateway = Arc::new(ScriptedGateway::new());
        let engine = DispatchEngine::new(
            DispatchConfig {
                dedup_bucket_secs: 86_400,
                base_delay_ms: 0,
                ..Default::default()
            },
            PhoneConfig::default(),
            TemplateRenderer::new(templates),
            Arc::new(MemoryRecordStore::new()),
            gateway.clone(),
            HealthMonitor::new(gateway.clone(), HealthConfig::default()),
        );

        let contacts = Arc::new(MemoryContactStore::new());
        let intake = NotificationIntake::new(ContactResolver::new(contacts.clone()), engine.clone());

        Fixture {
            intake,
            engine,
            contacts,
            gateway,
        }
    }

    fn contact(phone: &str, name: &str, contact_type: ContactType, opted_in: bool) -> Contact {
        Contact {
            subject_id: "s-1".to_string(),
            phone_raw: phone.to_string(),
            name: Some(name.to_string()),
            contact_type,
            active: true,
            receive_notifications: opted_in,
        }
    }

    fn entry_event() -> NotificationEvent {
        parse_event(
            br#"{
                "eventId": "scan-42",
                "eventType": "entry",
                "subjectId": "s-1",
                "variables": {"student_name": "Ani", "time": "07:05", "date": "2025-01-10"}
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn event_fans_out_to_eligible_contacts() {
        let f = fixture().await;
        f.contacts
            .insert(contact("081111111111", "Pak Budi", ContactType::PrimaryGuardian, true))
            .await;
        f.contacts
            .insert(contact("082222222222", "Bu Siti", ContactType::SecondaryGuardian, true))
            .await;
        f.contacts
            .insert(contact("083333333333", "Ani", ContactType::SubjectSelf, false))
            .await;

        let tally = f.intake.handle_event(&entry_event()).await.unwrap();
        assert_eq!(
            tally,
            IntakeTally {
                contacts: 2,
                dispatched: 2,
                rejected: 0
            }
        );

        let messages: Vec<String> = f.gateway.sent().into_iter().map(|m| m.message).collect();
        assert!(messages.contains(&"Halo Pak Budi, Ani tiba 07:05".to_string()));
        assert!(messages.contains(&"Halo Bu Siti, Ani tiba 07:05".to_string()));

        let records = f.engine.list_records(&RecordFilter::default()).await.unwrap();
        assert!(records.iter().any(|r| r.request_id == "scan-42:081111111111"));
    }

    #[tokio::test]
    async fn missing_required_variable_rejects_event() {
        let f = fixture().await;
        f.contacts
            .insert(contact("081111111111", "Pak Budi", ContactType::PrimaryGuardian, true))
            .await;

        let mut event = entry_event();
        event.variables.remove("date");

        let err = f.intake.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingVariable { ref name, .. } if name == "date"));
        assert_eq!(f.gateway.send_count(), 0);
    }

    #[tokio::test]
    async fn no_contacts_is_a_noop() {
        let f = fixture().await;
        let tally = f.intake.handle_event(&entry_event()).await.unwrap();
        assert_eq!(tally, IntakeTally::default());
    }

    #[tokio::test]
    async fn bad_contact_phone_does_not_block_others() {
        let f = fixture().await;
        f.contacts
            .insert(contact("12", "Typo", ContactType::PrimaryGuardian, true))
            .await;
        f.contacts
            .insert(contact("082222222222", "Bu Siti", ContactType::SecondaryGuardian, true))
            .await;

        let tally = f.intake.handle_event(&entry_event()).await.unwrap();
        assert_eq!(tally.rejected, 1);
        assert_eq!(tally.dispatched, 1);
        assert_eq!(f.gateway.send_count(), 1);
    }

    #[tokio::test]
    async fn redelivered_event_is_deduplicated() {
        let f = fixture().await;
        f.contacts
            .insert(contact("081111111111", "Pak Budi", ContactType::PrimaryGuardian, true))
            .await;

        f.intake.handle_event(&entry_event()).await.unwrap();
        f.intake.handle_event(&entry_event()).await.unwrap();

        assert_eq!(f.gateway.send_count(), 1);
        let summary = f.engine.status_summary().await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.total(), 1);
        assert_eq!(
            f.engine.list_records(&RecordFilter::default()).await.unwrap()[0].status,
            DeliveryStatus::Sent
        );
    }

    #[tokio::test]
    async fn session_event_uses_snake_case_payload() {
        let f = fixture().await;
        f.contacts
            .insert(contact("081111111111", "Pak Budi", ContactType::PrimaryGuardian, true))
            .await;

        let event = parse_event(
            br#"{"event_type": "session_start", "subject_id": "s-1",
                 "variables": {"session_name": "Matematika", "time": "08:00"}}"#,
        )
        .unwrap();
        f.intake.handle_event(&event).await.unwrap();

        assert_eq!(f.gateway.sent()[0].message, "Matematika dimulai 08:00");
    }

    const ENTRY_PAYLOAD: &[u8] = br#"{"eventId": "scan-7", "eventType": "entry", "subjectId": "s-1",
        "variables": {"student_name": "Ani", "time": "07:05", "date": "2025-01-10"}}"#;

    #[tokio::test]
    async fn payload_outcomes_drive_offset_commits() {
        let f = fixture().await;
        f.contacts
            .insert(contact("081111111111", "Pak Budi", ContactType::PrimaryGuardian, true))
            .await;

        let outcome = f.intake.handle_payload(ENTRY_PAYLOAD).await;
        assert_eq!(outcome, PayloadOutcome::Handled);
        assert!(outcome.should_commit());

        let outcome = f.intake.handle_payload(b"{not json").await;
        assert_eq!(outcome, PayloadOutcome::Skipped);
        assert!(outcome.should_commit());

        let outcome = f
            .intake
            .handle_payload(br#"{"eventType": "entry", "subjectId": "s-1", "variables": {}}"#)
            .await;
        assert_eq!(outcome, PayloadOutcome::Skipped);
        assert!(outcome.should_commit());
        assert_eq!(f.gateway.send_count(), 1);
    }

    #[tokio::test]
    async fn storage_failure_leaves_message_uncommitted() {
        let f = fixture().await;
        let intake = NotificationIntake::new(
            ContactResolver::new(Arc::new(UnreachableContacts)),
            f.engine.clone(),
        );

        let outcome = intake.handle_payload(ENTRY_PAYLOAD).await;
        assert_eq!(outcome, PayloadOutcome::Retry);
        assert!(!outcome.should_commit());
        assert_eq!(f.gateway.send_count(), 0);
    }
}
