//! Transport to the third-party WhatsApp gateway.
//!
//! A [`GatewayTransport`] performs exactly one network call per method and
//! never retries; retry counting and backoff belong to the dispatch engine.

use async_trait::async_trait;
use serde::Serialize;

pub mod scripted;
pub mod wablas;

pub use scripted::{ScriptedGateway, SentMessage};
pub use wablas::WablasClient;

/// How a single send attempt ended, as far as the transport can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    /// HTTP 200 with `status: true`.
    Delivered,
    /// HTTP 200 with `status: false`; the error message decides whether it is permanent.
    Rejected,
    /// Timeout, connection failure, non-200 status or an unreadable body.
    TransportFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayResult {
    pub outcome: SendOutcome,
    pub provider_message_id: Option<String>,
    pub raw_response: String,
    pub error_message: Option<String>,
}

impl GatewayResult {
    pub fn delivered(provider_message_id: Option<String>, raw_response: impl Into<String>) -> Self {
        Self {
            outcome: SendOutcome::Delivered,
            provider_message_id,
            raw_response: raw_response.into(),
            error_message: None,
        }
    }

    pub fn rejected(error_message: impl Into<String>, raw_response: impl Into<String>) -> Self {
        Self {
            outcome: SendOutcome::Rejected,
            provider_message_id: None,
            raw_response: raw_response.into(),
            error_message: Some(error_message.into()),
        }
    }

    pub fn transport_failure(error_message: impl Into<String>, raw_response: impl Into<String>) -> Self {
        Self {
            outcome: SendOutcome::TransportFailure,
            provider_message_id: None,
            raw_response: raw_response.into(),
            error_message: Some(error_message.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == SendOutcome::Delivered
    }
}

/// Device/connection state reported by the gateway's status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub quota_remaining: Option<i64>,
    pub detail: Option<String>,
    pub raw_response: String,
}

/// Failure to obtain a device status at all.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Transport(String),

    #[error("Gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed gateway response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Sends one message. Every failure is encoded in the result.
    async fn send(&self, phone: &str, message: &str) -> GatewayResult;

    /// Queries the device status/quota endpoint.
    async fn device_status(&self) -> Result<DeviceStatus, GatewayError>;
}
