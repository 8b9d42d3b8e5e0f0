//! Kafka bridge
//!
//! Consumes promotion pointers and claim checks from broker topics into the
//! in-process channels, and produces the claim consumer's inference events
//! and dead-letter reports onto output topics.

use crate::bus;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tidecast_common::config::KafkaConfig;
use tidecast_common::{Result, ServeError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-message delivery deadline for produced events
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Base client settings plus user properties
///
/// `bootstrap.servers` and `group.id` always come from their dedicated
/// fields.
fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.brokers);
    for (key, value) in &config.properties {
        if key != "bootstrap.servers" && key != "group.id" {
            client.set(key, value);
        }
    }
    client
}

/// Create a consumer subscribed to `topic`
pub fn subscribe(config: &KafkaConfig, topic: &str) -> Result<StreamConsumer> {
    let mut client = client_config(config);
    client
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest");

    let consumer: StreamConsumer = client
        .create()
        .map_err(|e| ServeError::config(format!("Failed to create Kafka consumer: {}", e)))?;
    consumer.subscribe(&[topic]).map_err(|e| {
        ServeError::config(format!("Failed to subscribe to '{}': {}", topic, e))
    })?;
    Ok(consumer)
}

/// Forward decoded messages from `consumer` into `tx` until the channel closes
///
/// Malformed messages are skipped and committed.
pub async fn consume<T>(consumer: StreamConsumer, topic: String, tx: mpsc::Sender<T>)
where
    T: DeserializeOwned + Send + 'static,
{
    info!(topic = %topic, "Kafka consumer started");
    let mut stream = consumer.stream();
    let mut consecutive_errors: u32 = 0;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                consecutive_errors += 1;
                let backoff = Duration::from_millis(100 * 2u64.pow(consecutive_errors.min(7)));
                error!(topic = %topic, backoff_ms = backoff.as_millis() as u64, error = %e, "Kafka receive failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };
        consecutive_errors = 0;

        match message.payload().map(bus::decode::<T>) {
            Some(Ok(item)) => {
                if tx.send(item).await.is_err() {
                    info!(topic = %topic, "Channel closed; Kafka consumer stopping");
                    break;
                }
            }
            Some(Err(e)) => warn!(
                topic = %topic,
                partition = message.partition(),
                offset = message.offset(),
                error = %e,
                "Skipping malformed message"
            ),
            None => debug!(topic = %topic, offset = message.offset(), "Skipping empty message"),
        }

        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
            warn!(topic = %topic, error = %e, "Offset commit failed");
        }
    }
    info!(topic = %topic, "Kafka consumer stopped");
}

/// Produces JSON events onto topics
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let mut client = client_config(config);
        client.set("message.timeout.ms", "30000").set("acks", "all");
        let producer = client
            .create()
            .map_err(|e| ServeError::config(format!("Failed to create Kafka producer: {}", e)))?;
        Ok(Self { producer })
    }

    /// Publish every event from `events` to `topic` until all senders are gone
    pub async fn forward<T: Serialize>(self, mut events: mpsc::Receiver<T>, topic: String) {
        info!(topic = %topic, "Kafka publisher started");
        while let Some(event) = events.recv().await {
            let payload = match serde_json::to_vec(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Dropping event that does not serialize");
                    continue;
                }
            };
            let record = FutureRecord::<(), Vec<u8>>::to(&topic).payload(&payload);
            if let Err((e, _)) = self.producer.send(record, SEND_TIMEOUT).await {
                error!(topic = %topic, error = %e, "Failed to publish event");
            }
        }
        info!(topic = %topic, "Kafka publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_keeps_dedicated_fields() {
        let mut config = KafkaConfig {
            brokers: "kafka-1:9092,kafka-2:9092".to_string(),
            ..KafkaConfig::default()
        };
        config
            .properties
            .insert("bootstrap.servers".to_string(), "elsewhere:9092".to_string());
        config
            .properties
            .insert("security.protocol".to_string(), "SASL_SSL".to_string());

        let client = client_config(&config);
        assert_eq!(client.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("group.id"), None);
    }
}
