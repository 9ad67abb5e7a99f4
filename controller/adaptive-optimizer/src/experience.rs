//! Bounded replay memory and the task that feeds it.
//!
//! Controllers never touch the buffer directly; they send experiences over a
//! channel to a single recorder task, and the retrain lane reads snapshots.

use crate::model::PointId;
use crate::optimizer::Action;
use crate::policy::FeatureVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One (state, action, reward, next state) transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub point_id: PointId,
    pub state: FeatureVector,
    pub action: Action,
    pub reward: f64,
    pub next_state: FeatureVector,
    /// The action ended in FAILED; no future value is bootstrapped.
    pub terminal: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Buffer {
    records: VecDeque<Experience>,
    total_inserted: u64,
}

/// FIFO replay memory with a fixed capacity.
#[derive(Debug)]
pub struct ExperienceStore {
    capacity: usize,
    inner: Mutex<Buffer>,
}

impl ExperienceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Buffer {
                records: VecDeque::with_capacity(capacity.clamp(1, 4096)),
                total_inserted: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an experience, evicting and returning the oldest when full.
    pub fn push(&self, experience: Experience) -> Option<Experience> {
        let mut buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let evicted = if buffer.records.len() >= self.capacity {
            buffer.records.pop_front()
        } else {
            None
        };
        buffer.records.push_back(experience);
        buffer.total_inserted += 1;
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_inserted(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_inserted
    }

    /// Copy of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<Experience> {
        let buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.records.iter().cloned().collect()
    }
}

enum RecorderMessage {
    Record(Experience),
    Barrier(oneshot::Sender<()>),
}

/// Cloneable handle controllers use to submit experiences.
#[derive(Clone)]
pub struct ExperienceRecorder {
    tx: mpsc::Sender<RecorderMessage>,
}

impl ExperienceRecorder {
    /// Spawn the recorder task that owns writes to `store`.
    pub fn spawn(store: Arc<ExperienceStore>, queue_depth: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(queue_depth.max(1));

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    RecorderMessage::Record(experience) => {
                        let point_id = experience.point_id.clone();
                        if store.push(experience).is_some() {
                            debug!(point_id = %point_id, "Replay memory full, evicted oldest experience");
                        }
                    }
                    RecorderMessage::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Experience recorder stopped");
        });

        (Self { tx }, handle)
    }

    pub async fn record(&self, experience: Experience) {
        if self.tx.send(RecorderMessage::Record(experience)).await.is_err() {
            warn!("Experience recorder is gone; dropping experience");
        }
    }

    /// Wait until everything recorded before this call has been stored.
    pub async fn sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RecorderMessage::Barrier(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FEATURE_COUNT;

    fn experience(reward: f64) -> Experience {
        Experience {
            point_id: "p-1".into(),
            state: FeatureVector([0.0; FEATURE_COUNT]),
            action: Action::NoOp,
            reward,
            next_state: FeatureVector([0.0; FEATURE_COUNT]),
            terminal: false,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_push_evicts_oldest_at_capacity() {
        let store = ExperienceStore::new(3);
        for reward in [1.0, 2.0, 3.0] {
            assert!(store.push(experience(reward)).is_none());
        }

        let evicted = store.push(experience(4.0)).unwrap();
        assert_eq!(evicted.reward, 1.0);
        assert_eq!(store.len(), 3);
        assert_eq!(store.total_inserted(), 4);

        let rewards: Vec<f64> = store.snapshot().iter().map(|e| e.reward).collect();
        assert_eq!(rewards, vec![2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_recorder_applies_in_order() {
        let store = Arc::new(ExperienceStore::new(10));
        let (recorder, _task) = ExperienceRecorder::spawn(store.clone(), 4);

        for reward in 0..6 {
            recorder.record(experience(reward as f64)).await;
        }
        recorder.sync().await;

        let rewards: Vec<f64> = store.snapshot().iter().map(|e| e.reward).collect();
        assert_eq!(rewards, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
