use anyhow::{anyhow, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use std::sync::Arc;
use tracing;

use crate::config::RedpandaConfig;

pub type RedpandaConsumer = Arc<StreamConsumer>;

fn client_config(config: &RedpandaConfig, group: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", group)
        .set("broker.address.family", "v4")
        .set("socket.keepalive.enable", "true")
        .set("session.timeout.ms", "30000")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest")
        // Offsets are committed after an event has been handled.
        .set("enable.auto.commit", "false");

    if let Some(tls) = &config.tls {
        client.set("security.protocol", "ssl");
        for (key, value) in [
            ("ssl.ca.location", &tls.ca_location),
            ("ssl.certificate.location", &tls.cert_location),
            ("ssl.key.location", &tls.key_location),
        ] {
            if let Some(path) = value {
                client.set(key, path);
            }
        }
    }

    client
}

/// Builds a consumer for `group_id`, or the configured consumer group.
/// librdkafka connects lazily, so this succeeds without a reachable broker.
pub fn create_consumer(config: &RedpandaConfig, group_id: Option<&str>) -> Result<RedpandaConsumer> {
    let group = group_id.unwrap_or(&config.consumer_group);
    tracing::info!(
        "Creating Redpanda consumer for group {} (brokers: {}, tls: {})",
        group,
        config.brokers,
        config.tls.is_some()
    );

    let consumer: StreamConsumer = client_config(config, group).create().map_err(|e| {
        tracing::error!("Failed to create Redpanda consumer for {}: {}", config.brokers, e);
        anyhow!("Failed to create Redpanda consumer: {}", e)
    })?;

    Ok(Arc::new(consumer))
}
