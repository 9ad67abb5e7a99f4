//! JetStream consumer feeding raw metrics samples into the aggregator.
//!
//! Producers publish one JSON sample per message on
//! `aain.integration.v1.<point>.samples`. Samples are best effort: anything
//! malformed, late or for an unmanaged point is acked and dropped.

use crate::aggregator::{MetricsAggregator, MetricsSample};
use crate::events::EVENT_SUBJECT_PREFIX;
use crate::model::PointId;
use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, DeliverPolicy, PullConsumer},
    stream::Stream,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use nexus_config::IngestSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const BATCH_EXPIRY: Duration = Duration::from_secs(5);
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Wire form of one observed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMessage {
    pub point_id: PointId,
    /// Defaults to the time the message was received.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub latency_ms: u64,
    pub success: bool,
}

impl SampleMessage {
    pub fn into_sample(self, received_at: DateTime<Utc>) -> MetricsSample {
        MetricsSample::new(
            self.point_id,
            self.timestamp.unwrap_or(received_at),
            Duration::from_millis(self.latency_ms),
            self.success,
        )
    }
}

pub fn samples_subject(point_id: &str) -> String {
    format!("{}.{}.samples", EVENT_SUBJECT_PREFIX, point_id)
}

fn decode(payload: &[u8], received_at: DateTime<Utc>) -> Result<MetricsSample, serde_json::Error> {
    serde_json::from_slice::<SampleMessage>(payload).map(|m| m.into_sample(received_at))
}

pub struct SampleConsumer {
    settings: IngestSettings,
    aggregator: Arc<MetricsAggregator>,
}

impl SampleConsumer {
    pub fn new(settings: IngestSettings, aggregator: Arc<MetricsAggregator>) -> Self {
        Self {
            settings,
            aggregator,
        }
    }

    /// Consume until shutdown. Connection and setup failures are returned;
    /// per-message failures are logged and skipped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let url = self
            .settings
            .nats_url
            .as_deref()
            .context("ingest.nats_url is required to consume samples")?;
        info!("Connecting to NATS at {} for sample ingestion", url);
        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;
        let js = jetstream::new(client);

        let stream = self.ensure_stream(&js).await?;
        let consumer = self.create_consumer(&stream).await?;
        info!(
            consumer_name = %self.settings.consumer_name,
            stream = %self.settings.stream_name,
            "Sample consumer ready"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                processed = self.process_batch(&consumer) => {
                    if processed? == 0 {
                        tokio::time::sleep(IDLE_BACKOFF).await;
                    }
                }
            }
        }
        info!("Sample consumer stopped");
        Ok(())
    }

    async fn ensure_stream(&self, js: &jetstream::Context) -> Result<Stream> {
        let name = &self.settings.stream_name;
        match js.get_stream(name).await {
            Ok(stream) => {
                info!("Found existing stream: {}", name);
                Ok(stream)
            }
            Err(_) => {
                info!("Stream {} not found, creating it", name);
                js.get_or_create_stream(jetstream::stream::Config {
                    name: name.clone(),
                    subjects: vec![samples_subject("*")],
                    max_age: Duration::from_secs(3600),
                    ..Default::default()
                })
                .await
                .context("Failed to create sample stream")
            }
        }
    }

    async fn create_consumer(&self, stream: &Stream) -> Result<PullConsumer> {
        let name = &self.settings.consumer_name;
        stream
            .get_or_create_consumer(
                name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: samples_subject("*"),
                    deliver_policy: DeliverPolicy::New,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create sample consumer")
    }

    async fn process_batch(&self, consumer: &PullConsumer) -> Result<usize> {
        let mut messages = consumer
            .batch()
            .max_messages(self.settings.batch_size)
            .expires(BATCH_EXPIRY)
            .messages()
            .await
            .context("Failed to fetch sample batch")?;

        let mut processed = 0;
        let mut dropped = 0;
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    error!("Error receiving sample: {}", e);
                    continue;
                }
            };
            processed += 1;

            match decode(&message.payload, Utc::now()) {
                Ok(sample) => {
                    if !self.aggregator.record(sample) {
                        dropped += 1;
                    }
                }
                Err(e) => {
                    warn!(subject = %message.subject, error = %e, "Malformed sample");
                    dropped += 1;
                }
            }
            if let Err(e) = message.ack().await {
                error!("Failed to ack sample: {}", e);
            }
        }

        if processed > 0 {
            debug!(processed = processed, dropped = dropped, "Ingested sample batch");
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_defaults_timestamp_to_receipt() {
        let received = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let sample = decode(
            br#"{"point_id":"orders","latency_ms":120,"success":true}"#,
            received,
        )
        .unwrap();

        assert_eq!(sample.point_id, "orders");
        assert_eq!(sample.timestamp, received);
        assert_eq!(sample.latency, Duration::from_millis(120));
    }

    #[test]
    fn test_decode_keeps_explicit_timestamp() {
        let sample = decode(
            br#"{"point_id":"orders","timestamp":"2024-05-01T00:00:07Z","latency_ms":5,"success":false}"#,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 7).unwrap()
        );
        assert!(!sample.success);
    }

    #[test]
    fn test_decode_rejects_missing_latency() {
        assert!(decode(br#"{"point_id":"orders","success":true}"#, Utc::now()).is_err());
    }

    #[test]
    fn test_samples_subject() {
        assert_eq!(samples_subject("orders"), "aain.integration.v1.orders.samples");
    }
}
