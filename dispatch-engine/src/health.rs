use chrono::Utc;
use dispatch_core::config::HealthConfig;
use dispatch_core::GatewayHealthStatus;
use dispatch_gateway::GatewayTransport;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing;

struct Inner {
    transport: Arc<dyn GatewayTransport>,
    config: HealthConfig,
    status: watch::Sender<GatewayHealthStatus>,
    checking: Mutex<()>,
}

/// Cached gateway connectivity.
///
/// The monitor is the only writer of [`GatewayHealthStatus`]; readers get a
/// clone of the last published snapshot and never wait on a status check.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(transport: Arc<dyn GatewayTransport>, config: HealthConfig) -> Self {
        let (status, _) = watch::channel(GatewayHealthStatus::unknown(config.check_interval_secs));
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                status,
                checking: Mutex::new(()),
            }),
        }
    }

    pub fn get_cached(&self) -> GatewayHealthStatus {
        self.inner.status.borrow().clone()
    }

    /// Forces a check of the device status endpoint.
    pub async fn check_now(&self) -> GatewayHealthStatus {
        let _checking = self.inner.checking.lock().await;
        self.refresh().await
    }

    /// Status to gate a send on. A stale cache is refreshed first; when a
    /// check is already running the caller waits for its result instead of
    /// starting another.
    pub async fn status_for_dispatch(&self) -> GatewayHealthStatus {
        if !self.inner.config.enabled {
            return GatewayHealthStatus {
                connected: true,
                ..self.get_cached()
            };
        }

        let cached = self.get_cached();
        if cached.is_fresh(Utc::now()) {
            return cached;
        }

        let _checking = self.inner.checking.lock().await;
        let cached = self.get_cached();
        if cached.is_fresh(Utc::now()) {
            return cached;
        }
        self.refresh().await
    }

    async fn refresh(&self) -> GatewayHealthStatus {
        let previous = self.get_cached();
        let checked_at = Utc::now();

        let status = match self.inner.transport.device_status().await {
            Ok(device) => GatewayHealthStatus {
                connected: device.connected,
                last_checked_at: Some(checked_at),
                last_error: device.detail,
                quota_remaining: device.quota_remaining.or(previous.quota_remaining),
                check_interval_seconds: self.inner.config.check_interval_secs,
            },
            Err(e) => GatewayHealthStatus {
                connected: false,
                last_checked_at: Some(checked_at),
                last_error: Some(e.to_string()),
                quota_remaining: previous.quota_remaining,
                check_interval_seconds: self.inner.config.check_interval_secs,
            },
        };

        if status.connected != previous.connected || previous.last_checked_at.is_none() {
            if status.connected {
                tracing::info!("Gateway connected (quota: {:?})", status.quota_remaining);
            } else {
                tracing::warn!(
                    "Gateway unavailable: {}",
                    status.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        self.inner.status.send_replace(status.clone());
        status
    }

    /// Checks on a fixed schedule until the task is dropped.
    pub async fn run(self) {
        if !self.inner.config.enabled {
            tracing::info!("Gateway health checks disabled");
            return;
        }

        tracing::info!(
            "Starting gateway health monitor (every {}s)",
            self.inner.config.check_interval().as_secs()
        );

        let mut ticker = tokio::time::interval(self.inner.config.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_now().await;
        }
    }
}
