//! Structured observability events and where they go.
//!
//! Emitting never blocks the control loop: the tracing sink logs inline, the
//! JetStream sink hands events to a background publisher and drops them if
//! its queue is full.

use crate::model::{ConnectionParameters, PointId, StatusTransition};
use crate::optimizer::{Action, RetrainReport};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, publish::PublishAck};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subject prefix shared by published events and ingested samples.
pub const EVENT_SUBJECT_PREFIX: &str = "aain.integration.v1";

/// Subject token used for fleet-wide events.
const FLEET_TOKEN: &str = "optimizer";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObservabilityEvent {
    StatusTransition(StatusTransition),
    ActionApplied {
        point_id: PointId,
        action: Action,
        from: ConnectionParameters,
        to: ConnectionParameters,
        policy_version: u64,
        at: DateTime<Utc>,
    },
    /// `action` and `reward` are unknown when the action predates a restart.
    ActionRolledBack {
        point_id: PointId,
        action: Option<Action>,
        restored: ConnectionParameters,
        reward: Option<f64>,
        at: DateTime<Utc>,
    },
    ExperienceRecorded {
        point_id: PointId,
        action: Action,
        reward: f64,
        terminal: bool,
        at: DateTime<Utc>,
    },
    RetrainAccepted {
        run_id: String,
        report: RetrainReport,
        at: DateTime<Utc>,
    },
    RetrainRejected {
        run_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    CycleSkipped {
        point_id: PointId,
        reason: String,
        at: DateTime<Utc>,
    },
    Backpressure {
        point_id: PointId,
        waited_ms: u64,
        at: DateTime<Utc>,
    },
}

impl ObservabilityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ObservabilityEvent::StatusTransition(_) => "status_transition",
            ObservabilityEvent::ActionApplied { .. } => "action_applied",
            ObservabilityEvent::ActionRolledBack { .. } => "action_rolled_back",
            ObservabilityEvent::ExperienceRecorded { .. } => "experience_recorded",
            ObservabilityEvent::RetrainAccepted { .. } => "retrain_accepted",
            ObservabilityEvent::RetrainRejected { .. } => "retrain_rejected",
            ObservabilityEvent::CycleSkipped { .. } => "cycle_skipped",
            ObservabilityEvent::Backpressure { .. } => "backpressure",
        }
    }

    /// The point the event concerns; `None` for fleet-wide events.
    pub fn point_id(&self) -> Option<&str> {
        match self {
            ObservabilityEvent::StatusTransition(t) => Some(&t.point_id),
            ObservabilityEvent::ActionApplied { point_id, .. }
            | ObservabilityEvent::ActionRolledBack { point_id, .. }
            | ObservabilityEvent::ExperienceRecorded { point_id, .. }
            | ObservabilityEvent::CycleSkipped { point_id, .. }
            | ObservabilityEvent::Backpressure { point_id, .. } => Some(point_id),
            ObservabilityEvent::RetrainAccepted { .. }
            | ObservabilityEvent::RetrainRejected { .. } => None,
        }
    }

    /// Subject pattern: `aain.integration.v1.<point>.events`
    pub fn subject(&self) -> String {
        let token = self
            .point_id()
            .map(subject_token)
            .unwrap_or_else(|| FLEET_TOKEN.to_string());
        format!("{}.{}.events", EVENT_SUBJECT_PREFIX, token)
    }
}

/// Make a point id safe to use as a single subject token.
fn subject_token(point_id: &str) -> String {
    point_id
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

/// Destination for observability events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ObservabilityEvent);
}

/// Logs each event as a structured tracing record.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ObservabilityEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(
            event = event.name(),
            point_id = event.point_id().unwrap_or(FLEET_TOKEN),
            payload = %payload,
            "Observability event"
        );
    }
}

/// Keeps events in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl CollectingEventSink {
    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the collected events, in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.name())
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: ObservabilityEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Publishes events to a JetStream stream from a background task.
pub struct JetStreamEventSink {
    tx: mpsc::Sender<ObservabilityEvent>,
    dropped: Arc<AtomicU64>,
}

impl JetStreamEventSink {
    const QUEUE_DEPTH: usize = 1024;

    /// Connect, make sure the stream exists and start the publisher.
    pub async fn connect(nats_url: &str, stream_name: &str) -> Result<(Self, JoinHandle<()>)> {
        info!("Connecting to NATS at {} for event publishing", nats_url);
        let client = async_nats::connect(nats_url)
            .await
            .context("Failed to connect to NATS")?;
        let js = jetstream::new(client);

        js.get_or_create_stream(jetstream::stream::Config {
            name: stream_name.to_string(),
            subjects: vec![format!("{}.*.events", EVENT_SUBJECT_PREFIX)],
            max_age: Duration::from_secs(3600 * 24 * 7),
            ..Default::default()
        })
        .await
        .context("Failed to ensure event stream")?;
        info!(stream = %stream_name, "Event stream ready");

        let (tx, mut rx) = mpsc::channel::<ObservabilityEvent>(Self::QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = publish(&js, &event).await {
                    warn!(event = event.name(), error = %e, "Failed to publish event");
                }
            }
            debug!("Event publisher stopped");
        });

        Ok((
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        ))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn publish(js: &jetstream::Context, event: &ObservabilityEvent) -> Result<()> {
    let subject = event.subject();
    let payload = serde_json::to_vec(event).context("Failed to serialize event")?;
    let ack: PublishAck = js
        .publish(subject.clone(), payload.into())
        .await
        .context("Failed to publish event to JetStream")?
        .await
        .context("Failed to get publish acknowledgement")?;
    debug!(subject = %subject, sequence = ack.sequence, "Published event");
    Ok(())
}

impl EventSink for JetStreamEventSink {
    fn emit(&self, event: ObservabilityEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped_total = total, error = %e, "Event queue full or closed; dropping event");
        }
    }
}
