use anyhow::Result;
use dispatch_core::DispatchContext;
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::Message;
use std::time::{Duration, Instant};
use tracing;

use crate::service::NotificationIntake;

pub async fn run(ctx: DispatchContext, intake: NotificationIntake) -> Result<()> {
    let redpanda = &ctx.config.redpanda;
    tracing::info!("Starting notification intake consumer");

    let consumer = ctx.create_consumer(None)?;
    consumer.subscribe(&[redpanda.events_topic.as_str()])?;

    tracing::info!("Subscribed to topic: {}", redpanda.events_topic);

    let mut error_count = 0u32;
    let mut last_error_log: Option<Instant> = None;

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0;
                if let Some(payload) = message.payload() {
                    let mut failures = 0u32;
                    while !intake.handle_payload(payload).await.should_commit() {
                        failures += 1;
                        tracing::warn!(
                            "Reprocessing {}[{}]@{} after storage failure (attempt {})",
                            message.topic(),
                            message.partition(),
                            message.offset(),
                            failures
                        );
                        tokio::time::sleep(backoff(failures)).await;
                    }
                }
                // Redelivery after a crash is harmless: dispatch dedups by fingerprint.
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!("Failed to commit offset {}: {}", message.offset(), e);
                }
            }
            Err(e) => {
                error_count += 1;
                // Only log receive errors every 30 seconds
                if last_error_log.map_or(true, |at| at.elapsed().as_secs() >= 30) {
                    tracing::warn!(
                        "Error receiving message from Redpanda (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = Some(Instant::now());
                }
                tokio::time::sleep(backoff(error_count)).await;
            }
        }
    }
}

// 2s, 4s, 8s, ... max 30s
fn backoff(failures: u32) -> Duration {
    Duration::from_secs(1 << failures.min(5)).min(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(5), Duration::from_secs(30));
        assert_eq!(backoff(u32::MAX), Duration::from_secs(30));
    }
}
