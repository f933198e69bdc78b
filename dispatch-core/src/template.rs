use anyhow::anyhow;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::DbPool;
use crate::error::DispatchError;
use crate::schema::notification_templates;
use crate::types::EventType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: i64,
    pub event_type: EventType,
    pub language: String,
    pub body: String,
    pub priority: i32,
    pub active: bool,
}

/// Source of message templates keyed by `(event_type, language)`.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn find_templates(&self, event_type: EventType, language: &str) -> anyhow::Result<Vec<MessageTemplate>>;
}

/// Variables the event producer must supply for each event type. The
/// renderer itself is lenient; this list is checked upstream before render.
pub fn required_variables(event_type: EventType) -> &'static [&'static str] {
    match event_type {
        EventType::Entry | EventType::Exit | EventType::Late => &["student_name", "time", "date"],
        EventType::Absent => &["student_name", "date"],
        EventType::SessionStart
        | EventType::SessionBreak
        | EventType::SessionResume
        | EventType::SessionFinish => &["session_name", "time"],
        EventType::Custom => &[],
    }
}

pub fn validate_required(
    event_type: EventType,
    variables: &HashMap<String, String>,
) -> Result<(), DispatchError> {
    for name in required_variables(event_type) {
        let present = variables
            .get(*name)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Err(DispatchError::MissingVariable {
                event_type,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replaces `{name}` placeholders. Unknown names become empty strings; braces
/// that do not enclose a valid name are left as they are.
pub fn substitute(body: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_name(&after[..close]) => {
                if let Some(value) = variables.get(&after[..close]) {
                    out.push_str(value);
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[derive(Clone)]
pub struct TemplateRenderer {
    store: Arc<dyn TemplateStore>,
}

impl TemplateRenderer {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    /// Renders the highest-priority active template for `(event_type, language)`.
    pub async fn render(
        &self,
        event_type: EventType,
        language: &str,
        variables: &HashMap<String, String>,
    ) -> Result<String, DispatchError> {
        let templates = self.store.find_templates(event_type, language).await?;

        let template = templates
            .into_iter()
            .filter(|t| t.active && t.event_type == event_type && t.language == language)
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)))
            .ok_or_else(|| DispatchError::TemplateNotFound {
                event_type,
                language: language.to_string(),
            })?;

        tracing::debug!(
            "Rendering template {} for event {} ({})",
            template.id,
            event_type,
            language
        );

        Ok(substitute(&template.body, variables))
    }
}

/// In-process template store.
#[derive(Default)]
pub struct MemoryTemplateStore {
    templates: RwLock<Vec<MessageTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, event_type: EventType, language: &str, body: &str, priority: i32) -> MessageTemplate {
        let mut templates = self.templates.write().await;
        let template = MessageTemplate {
            id: templates.len() as i64 + 1,
            event_type,
            language: language.to_string(),
            body: body.to_string(),
            priority,
            active: true,
        };
        templates.push(template.clone());
        template
    }

    pub async fn set_active(&self, id: i64, active: bool) {
        let mut templates = self.templates.write().await;
        if let Some(t) = templates.iter_mut().find(|t| t.id == id) {
            t.active = active;
        }
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn find_templates(&self, event_type: EventType, language: &str) -> anyhow::Result<Vec<MessageTemplate>> {
        let templates = self.templates.read().await;
        Ok(templates
            .iter()
            .filter(|t| t.event_type == event_type && t.language == language)
            .cloned()
            .collect())
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = notification_templates)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TemplateRow {
    id: i64,
    event_type: String,
    language: String,
    body: String,
    priority: i32,
    active: bool,
}

impl TryFrom<TemplateRow> for MessageTemplate {
    type Error = anyhow::Error;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(MessageTemplate {
            id: row.id,
            event_type: row
                .event_type
                .parse()
                .map_err(|e| anyhow!("Template {}: {}", row.id, e))?,
            language: row.language,
            body: row.body,
            priority: row.priority,
            active: row.active,
        })
    }
}

/// Template store backed by the `notification_templates` table.
pub struct PgTemplateStore {
    pool: Arc<DbPool>,
}

impl PgTemplateStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateStore for PgTemplateStore {
    async fn find_templates(&self, event_type: EventType, language: &str) -> anyhow::Result<Vec<MessageTemplate>> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<TemplateRow> = notification_templates::table
            .filter(notification_templates::event_type.eq(event_type.as_str()))
            .filter(notification_templates::language.eq(language))
            .filter(notification_templates::active.eq(true))
            .order((notification_templates::priority.desc(), notification_templates::id.asc()))
            .select(TemplateRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(MessageTemplate::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let out = substitute(
            "{student_name} tiba pukul {time}",
            &vars(&[("student_name", "Ani"), ("time", "07:05")]),
        );
        assert_eq!(out, "Ani tiba pukul 07:05");
    }

    #[test]
    fn missing_placeholder_becomes_empty() {
        let out = substitute("Halo {recipient_name}!", &HashMap::new());
        assert_eq!(out, "Halo !");
    }

    #[test]
    fn stray_braces_are_preserved() {
        let out = substitute("{ not a var } {x", &vars(&[("x", "1")]));
        assert_eq!(out, "{ not a var } {x");
        assert_eq!(substitute("{{x}}", &vars(&[("x", "1")])), "{1}");
    }

    #[test]
    fn required_variables_are_checked() {
        let err = validate_required(EventType::Entry, &vars(&[("student_name", "Ani"), ("time", "07:05")]))
            .unwrap_err();
        assert_eq!(err.kind(), "missing_variable");

        assert!(validate_required(EventType::Absent, &vars(&[("student_name", "Ani"), ("date", "2025-01-10")])).is_ok());
        assert!(validate_required(EventType::Custom, &HashMap::new()).is_ok());
    }

    #[test]
    fn blank_required_variable_is_missing() {
        let err = validate_required(EventType::Absent, &vars(&[("student_name", " "), ("date", "2025-01-10")]));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn renders_highest_priority_active_template() {
        let store = Arc::new(MemoryTemplateStore::new());
        store.insert(EventType::Entry, "id", "low {student_name}", 1).await;
        let high = store.insert(EventType::Entry, "id", "high {student_name}", 5).await;
        store.insert(EventType::Entry, "en", "english {student_name}", 9).await;

        let renderer = TemplateRenderer::new(store.clone());
        let out = renderer
            .render(EventType::Entry, "id", &vars(&[("student_name", "Ani")]))
            .await
            .unwrap();
        assert_eq!(out, "high Ani");

        store.set_active(high.id, false).await;
        let out = renderer
            .render(EventType::Entry, "id", &vars(&[("student_name", "Ani")]))
            .await
            .unwrap();
        assert_eq!(out, "low Ani");
    }

    #[tokio::test]
    async fn missing_template_is_an_error() {
        let renderer = TemplateRenderer::new(Arc::new(MemoryTemplateStore::new()));
        let err = renderer
            .render(EventType::Custom, "id", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TemplateNotFound { event_type: EventType::Custom, .. }));
    }
}
