pub mod config;
pub mod contacts;
pub mod context;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod phone;
pub mod redpanda;
pub mod schema;
pub mod template;
pub mod types;

pub use config::Config;
pub use contacts::{ContactResolver, ContactStore, MemoryContactStore, PgContactStore};
pub use context::DispatchContext;
pub use db::DbPool;
pub use error::{DispatchError, DispatchResult};
pub use phone::{NormalizedPhone, PhoneNormalizer};
pub use redpanda::RedpandaConsumer;
pub use template::{MemoryTemplateStore, PgTemplateStore, TemplateRenderer, TemplateStore};
pub use types::{
    Contact, ContactType, DeliveryStatus, EventType, GatewayHealthStatus, NewNotificationRecord,
    NotificationRecord, NotificationRequest, RecordFilter, StatusSummary,
};
