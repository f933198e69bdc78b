use anyhow::anyhow;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::DbPool;
use crate::schema::notification_contacts;
use crate::types::{Contact, EventType};

/// Backing store of subject contacts, consumed read-only.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn contacts_for_subject(&self, subject_id: &str) -> anyhow::Result<Vec<Contact>>;
}

/// Maps a subject and event to the contacts that should be notified.
///
/// Only active contacts that opted in are produced. The resolver makes no
/// dedup decision across contact types; duplicate sends are prevented by the
/// dispatch engine's request fingerprint.
#[derive(Clone)]
pub struct ContactResolver {
    store: Arc<dyn ContactStore>,
}

impl ContactResolver {
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self { store }
    }

    /// Lazily resolves eligible contacts, primary guardian first and the
    /// subject last. Nothing is queried until the stream is polled, and every
    /// call re-reads the current active/opt-in flags.
    pub fn resolve_contacts(
        &self,
        subject_id: &str,
        event_type: EventType,
    ) -> BoxStream<'static, anyhow::Result<Contact>> {
        let store = Arc::clone(&self.store);
        let subject_id = subject_id.to_string();

        stream::once(async move {
            tracing::debug!("Resolving contacts for subject {} ({})", subject_id, event_type);
            store.contacts_for_subject(&subject_id).await
        })
        .map_ok(|mut contacts| {
            // Stable, so store order breaks ties within a contact type.
            contacts.sort_by_key(|c| c.contact_type);
            stream::iter(contacts.into_iter().map(Ok::<_, anyhow::Error>))
        })
        .try_flatten()
        .try_filter(|contact| future::ready(contact.is_eligible()))
        .boxed()
    }
}

/// In-process contact store.
#[derive(Default)]
pub struct MemoryContactStore {
    contacts: RwLock<Vec<Contact>>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, contact: Contact) {
        self.contacts.write().await.push(contact);
    }

    pub async fn set_receive_notifications(&self, subject_id: &str, phone_raw: &str, enabled: bool) {
        let mut contacts = self.contacts.write().await;
        for contact in contacts
            .iter_mut()
            .filter(|c| c.subject_id == subject_id && c.phone_raw == phone_raw)
        {
            contact.receive_notifications = enabled;
        }
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn contacts_for_subject(&self, subject_id: &str) -> anyhow::Result<Vec<Contact>> {
        let contacts = self.contacts.read().await;
        Ok(contacts
            .iter()
            .filter(|c| c.subject_id == subject_id)
            .cloned()
            .collect())
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = notification_contacts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ContactRow {
    id: i64,
    subject_id: String,
    phone_raw: String,
    contact_name: Option<String>,
    contact_type: String,
    active: bool,
    receive_notifications: bool,
}

impl TryFrom<ContactRow> for Contact {
    type Error = anyhow::Error;

    fn try_from(row: ContactRow) -> Result<Self, Self::Error> {
        let contact_type = row
            .contact_type
            .parse()
            .map_err(|e| anyhow!("Contact {}: {}", row.id, e))?;
        Ok(Contact {
            subject_id: row.subject_id,
            phone_raw: row.phone_raw,
            name: row.contact_name,
            contact_type,
            active: row.active,
            receive_notifications: row.receive_notifications,
        })
    }
}

/// Contact store backed by the `notification_contacts` table.
pub struct PgContactStore {
    pool: Arc<DbPool>,
}

impl PgContactStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactStore for PgContactStore {
    async fn contacts_for_subject(&self, subject_id: &str) -> anyhow::Result<Vec<Contact>> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<ContactRow> = notification_contacts::table
            .filter(notification_contacts::subject_id.eq(subject_id))
            .order(notification_contacts::id.asc())
            .select(ContactRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(Contact::try_from).collect()
    }
}
