use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::{DeviceStatus, GatewayError, GatewayResult, GatewayTransport};

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub phone: String,
    pub message: String,
}

#[derive(Default)]
struct Script {
    sends: VecDeque<GatewayResult>,
    device: Option<Result<DeviceStatus, GatewayError>>,
    send_delay: Option<Duration>,
    sent: VecDeque<SentMessage>,
    send_count: usize,
    status_checks: usize,
}

/// Sent messages kept for inspection; older ones are dropped.
const SENT_HISTORY: usize = 1_000;

/// Gateway that answers from a script instead of the network.
///
/// Queued send results are consumed in order; once the queue is empty every
/// send is delivered. Used by tests and by the runner's dry-run mode.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_send(&self, result: GatewayResult) -> &Self {
        self.script().sends.push_back(result);
        self
    }

    pub fn push_rejection(&self, message: &str) -> &Self {
        self.push_send(GatewayResult::rejected(
            message,
            format!(r#"{{"status":false,"message":"{}"}}"#, message),
        ))
    }

    pub fn push_transport_failure(&self, message: &str) -> &Self {
        self.push_send(GatewayResult::transport_failure(message, ""))
    }

    pub fn set_device_status(&self, status: Result<DeviceStatus, GatewayError>) {
        self.script().device = Some(status);
    }

    pub fn set_connected(&self, connected: bool) {
        self.set_device_status(Ok(DeviceStatus {
            connected,
            quota_remaining: None,
            detail: (!connected).then(|| "device disconnected".to_string()),
            raw_response: String::new(),
        }));
    }

    /// Holds every send for `delay` before answering.
    pub fn set_send_delay(&self, delay: Duration) {
        self.script().send_delay = Some(delay);
    }

    /// The most recent sends, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.script().sent.iter().cloned().collect()
    }

    pub fn send_count(&self) -> usize {
        self.script().send_count
    }

    pub fn status_check_count(&self) -> usize {
        self.script().status_checks
    }
}

#[async_trait]
impl GatewayTransport for ScriptedGateway {
    async fn send(&self, phone: &str, message: &str) -> GatewayResult {
        let (delay, count) = {
            let mut script = self.script();
            if script.sent.len() == SENT_HISTORY {
                script.sent.pop_front();
            }
            script.sent.push_back(SentMessage {
                phone: phone.to_string(),
                message: message.to_string(),
            });
            script.send_count += 1;
            (script.send_delay, script.send_count)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script().sends.pop_front();
        scripted.unwrap_or_else(|| {
            tracing::info!("Scripted gateway accepted message {} for {}", count, phone);
            let id = format!("scripted-{}", count);
            GatewayResult::delivered(Some(id.clone()), format!(r#"{{"status":true,"data":{{"id":"{}"}}}}"#, id))
        })
    }

    async fn device_status(&self) -> Result<DeviceStatus, GatewayError> {
        let mut script = self.script();
        script.status_checks += 1;
        script.device.clone().unwrap_or_else(|| {
            Ok(DeviceStatus {
                connected: true,
                quota_remaining: None,
                detail: None,
                raw_response: String::new(),
            })
        })
    }
}
