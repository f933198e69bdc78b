use anyhow::Result;
use std::time::{Duration, Instant};
use tracing;

use crate::engine::DispatchEngine;

const STALL_SWEEP_EVERY: Duration = Duration::from_secs(30);

/// Drives scheduled retries and stall recovery until the task is dropped.
pub async fn run(engine: DispatchEngine) -> Result<()> {
    let poll_interval = engine.config().retry_poll_interval();
    tracing::info!(
        "Starting retry scheduler (poll every {}ms)",
        poll_interval.as_millis()
    );

    let mut last_stall_sweep: Option<Instant> = None;

    loop {
        if last_stall_sweep.map_or(true, |at| at.elapsed() >= STALL_SWEEP_EVERY) {
            if let Err(e) = engine.recover_stalled().await {
                tracing::error!("Error recovering stalled sends: {}", e);
            }
            last_stall_sweep = Some(Instant::now());
        }

        match engine.process_due_retries().await {
            Ok(_) => {
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!("Error in retry scheduler: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
