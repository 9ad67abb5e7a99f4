//! Periodic policy retraining, off the control path.

use crate::controller::ControllerContext;
use crate::error::TrainingError;
use crate::events::{EventSink, ObservabilityEvent};
use crate::experience::ExperienceStore;
use crate::optimizer::{Optimizer, RetrainReport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

pub struct RetrainLane {
    optimizer: Arc<Optimizer>,
    experiences: Arc<ExperienceStore>,
    events: Arc<dyn EventSink>,
    interval: Duration,
}

impl RetrainLane {
    pub fn new(ctx: &ControllerContext, experiences: Arc<ExperienceStore>) -> Self {
        Self {
            optimizer: ctx.optimizer.clone(),
            experiences,
            events: ctx.events.clone(),
            interval: ctx.config.retrain_interval,
        }
    }

    /// Retrain once on a snapshot of replay memory.
    ///
    /// Training runs on the blocking pool; controllers keep reading the
    /// current policy until the candidate is accepted and swapped in.
    pub async fn retrain_once(&self, now: DateTime<Utc>) -> Result<RetrainReport, TrainingError> {
        let run_id = Uuid::new_v4().to_string();
        let snapshot = self.experiences.snapshot();
        info!(
            run_id = %run_id,
            experiences = snapshot.len(),
            policy_version = self.optimizer.policy().version(),
            "Starting policy retrain"
        );

        let optimizer = self.optimizer.clone();
        let result = tokio::task::spawn_blocking(move || optimizer.retrain(&snapshot, now))
            .await
            .unwrap_or_else(|e| {
                Err(TrainingError::Aborted {
                    message: e.to_string(),
                })
            });

        match &result {
            Ok(report) => {
                info!(
                    run_id = %run_id,
                    policy_version = report.policy_version,
                    current_reward = report.current_reward,
                    candidate_reward = report.candidate_reward,
                    candidate_error = report.candidate_error,
                    exploration_rate = report.exploration_rate,
                    persisted = report.persisted,
                    "Retrained policy accepted"
                );
                self.events.emit(ObservabilityEvent::RetrainAccepted {
                    run_id,
                    report: report.clone(),
                    at: now,
                });
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Retrain rejected; keeping current policy");
                self.events.emit(ObservabilityEvent::RetrainRejected {
                    run_id,
                    reason: e.to_string(),
                    at: now,
                });
            }
        }
        result
    }

    /// Retrain every `retrain_interval` until shutdown. The first run waits a
    /// full interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "Retrain lane started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    // outcome is already logged and emitted
                    let _ = self.retrain_once(Utc::now()).await;
                }
            }
        }
        info!("Retrain lane stopped");
    }
}
