use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dispatch_core::config::GatewayConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing;

use crate::{DeviceStatus, GatewayError, GatewayResult, GatewayTransport};

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    phone: &'a str,
    message: &'a str,
    #[serde(rename = "isGroup")]
    is_group: bool,
}

/// Common `{status, message, data}` envelope of every Wablas response.
#[derive(Debug, Deserialize)]
struct WablasEnvelope {
    #[serde(default)]
    status: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl WablasEnvelope {
    fn ok(&self) -> bool {
        truthy(&self.status)
    }

    fn message_id(&self) -> Option<String> {
        let data = self.data.as_ref()?;
        data.pointer("/messages/0/id")
            .or_else(|| data.get("id"))
            .or_else(|| data.get("message_id"))
            .and_then(scalar_string)
    }
}

/// The gateway is inconsistent about boolean encoding across endpoints.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "success" | "ok"),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn describe_request_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        format!("request failed: {}", e)
    }
}

/// HTTP client for the Wablas WhatsApp gateway.
pub struct WablasClient {
    client: Arc<reqwest::Client>,
    send_url: String,
    status_url: String,
    authorization: String,
}

impl WablasClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        tracing::info!("Initializing Wablas gateway client for {}", config.base_url);

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            client: Arc::new(client),
            send_url: format!("{}{}", base, config.send_path),
            status_url: format!("{}{}", base, config.status_path),
            authorization: config.authorization(),
        })
    }
}

#[async_trait]
impl GatewayTransport for WablasClient {
    async fn send(&self, phone: &str, message: &str) -> GatewayResult {
        let request = SendMessageRequest {
            phone,
            message,
            is_group: false,
        };

        let response = match self
            .client
            .post(&self.send_url)
            .header("Authorization", &self.authorization)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Wablas send to {} failed: {}", phone, e);
                return GatewayResult::transport_failure(describe_request_error(&e), "");
            }
        };

        let status = response.status();
        let raw = match response.text().await {
            Ok(body) => body,
            Err(e) => return GatewayResult::transport_failure(describe_request_error(&e), ""),
        };

        if status != StatusCode::OK {
            tracing::warn!("Wablas returned HTTP {} for {}", status, phone);
            return GatewayResult::transport_failure(format!("gateway returned HTTP {}", status.as_u16()), raw);
        }

        let envelope: WablasEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => return GatewayResult::transport_failure(format!("malformed gateway response: {}", e), raw),
        };

        if envelope.ok() {
            let message_id = envelope.message_id();
            tracing::debug!("Message accepted by Wablas for {} (id: {:?})", phone, message_id);
            GatewayResult::delivered(message_id, raw)
        } else {
            let reason = envelope
                .message
                .clone()
                .unwrap_or_else(|| "gateway reported failure".to_string());
            tracing::debug!("Wablas rejected message for {}: {}", phone, reason);
            GatewayResult::rejected(reason, raw)
        }
    }

    async fn device_status(&self) -> Result<DeviceStatus, GatewayError> {
        let response = self
            .client
            .get(&self.status_url)
            .header("Authorization", &self.authorization)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(describe_request_error(&e)))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(describe_request_error(&e)))?;

        if status != StatusCode::OK {
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body: raw,
            });
        }

        let envelope: WablasEnvelope =
            serde_json::from_str(&raw).map_err(|e| GatewayError::Decode(e.to_string()))?;

        let data = envelope.data.as_ref();
        let device_state = data
            .and_then(|d| d.get("status"))
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase);
        let connected = envelope.ok()
            && device_state
                .as_deref()
                .map(|s| s == "connected")
                .unwrap_or(true);
        let quota_remaining = data.and_then(|d| d.get("quota")).and_then(|q| match q {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });

        let detail = if connected {
            None
        } else {
            Some(
                device_state
                    .map(|s| format!("device {}", s))
                    .or_else(|| envelope.message.clone())
                    .unwrap_or_else(|| "device not connected".to_string()),
            )
        };

        Ok(DeviceStatus {
            connected,
            quota_remaining,
            detail,
            raw_response: raw,
        })
    }
}
