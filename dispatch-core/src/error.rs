use crate::types::{DeliveryStatus, EventType};

/// Errors surfaced synchronously by the dispatch pipeline.
///
/// Validation errors (`InvalidPhone`, `TemplateNotFound`, `MissingVariable`)
/// are raised before anything is persisted. Gateway failures never show up
/// here; they are recorded on the notification record instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid phone number {raw:?}: {reason}")]
    InvalidPhone { raw: String, reason: String },

    #[error("No active template for event {event_type} in language {language:?}")]
    TemplateNotFound { event_type: EventType, language: String },

    #[error("Missing required variable {name:?} for event {event_type}")]
    MissingVariable { event_type: EventType, name: String },

    #[error("Notification record {0} not found")]
    NotFound(i64),

    #[error("Notification record {id} is {status} and cannot be retried")]
    NotRetryable { id: i64, status: DeliveryStatus },

    #[error("Notification record {id} is already {status}")]
    AlreadyTerminal { id: i64, status: DeliveryStatus },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl DispatchError {
    /// Stable identifier for API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidPhone { .. } => "invalid_phone",
            DispatchError::TemplateNotFound { .. } => "template_not_found",
            DispatchError::MissingVariable { .. } => "missing_variable",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::NotRetryable { .. } => "not_retryable",
            DispatchError::AlreadyTerminal { .. } => "already_terminal",
            DispatchError::Storage(_) => "storage",
        }
    }

    /// True for errors caused by the request itself rather than by state or infrastructure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidPhone { .. }
                | DispatchError::TemplateNotFound { .. }
                | DispatchError::MissingVariable { .. }
        )
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
