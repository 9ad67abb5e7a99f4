//! Linear action-value policy.
//!
//! Each action owns a weight vector over the window features; the value of
//! taking an action in a state is the dot product. Training is semi-gradient
//! Q-learning over a sampled batch and always produces a new `Policy`, so the
//! one being served is never mutated in place.

use crate::experience::Experience;
use crate::optimizer::{Action, ACTION_COUNT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FEATURE_COUNT: usize = 6;

/// Normalized view of a window: `[bias, throughput ratio, latency ratio,
/// error rate, pool utilisation, has data]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn dot(&self, weights: &[f64; FEATURE_COUNT]) -> f64 {
        self.0.iter().zip(weights.iter()).map(|(x, w)| x * w).sum()
    }
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Failed to access policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Policy file {path} is malformed: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Policy file {path} holds non-finite weights")]
    NonFinite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    version: u64,
    weights: [[f64; FEATURE_COUNT]; ACTION_COUNT],
    trained_at: Option<DateTime<Utc>>,
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_weights([[0.0; FEATURE_COUNT]; ACTION_COUNT])
    }
}

impl Policy {
    pub fn from_weights(weights: [[f64; FEATURE_COUNT]; ACTION_COUNT]) -> Self {
        Self {
            version: 0,
            weights,
            trained_at: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn weights(&self) -> &[[f64; FEATURE_COUNT]; ACTION_COUNT] {
        &self.weights
    }

    pub fn trained_at(&self) -> Option<DateTime<Utc>> {
        self.trained_at
    }

    pub fn q_value(&self, state: &FeatureVector, action: Action) -> f64 {
        state.dot(&self.weights[action.index()])
    }

    pub fn max_q(&self, state: &FeatureVector) -> f64 {
        Action::ALL
            .iter()
            .map(|a| self.q_value(state, *a))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Highest-valued candidate. Ties go to `NoOp`, then to the earlier action.
    pub fn greedy(&self, state: &FeatureVector, candidates: &[Action]) -> Action {
        let mut best = if candidates.contains(&Action::NoOp) || candidates.is_empty() {
            Action::NoOp
        } else {
            candidates[0]
        };
        let mut best_q = self.q_value(state, best);

        for action in candidates {
            let q = self.q_value(state, *action);
            if q > best_q {
                best = *action;
                best_q = q;
            }
        }
        best
    }

    /// One pass of semi-gradient Q-learning over `batch`, as a new policy.
    pub fn train(
        &self,
        batch: &[&Experience],
        learning_rate: f64,
        discount: f64,
        now: DateTime<Utc>,
    ) -> Policy {
        let mut candidate = self.clone();
        for experience in batch {
            let bootstrap = if experience.terminal {
                0.0
            } else {
                candidate.max_q(&experience.next_state)
            };
            let target = experience.reward + discount * bootstrap;
            let delta = target - candidate.q_value(&experience.state, experience.action);

            let row = &mut candidate.weights[experience.action.index()];
            for (w, x) in row.iter_mut().zip(experience.state.0.iter()) {
                *w += learning_rate * delta * x;
            }
        }
        candidate.version = self.version + 1;
        candidate.trained_at = Some(now);
        candidate
    }

    /// Estimated average reward of acting greedily in the states of `data`.
    pub fn estimated_reward(&self, data: &[Experience]) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let total: f64 = data.iter().map(|e| self.max_q(&e.state)).sum();
        total / data.len() as f64
    }

    /// Mean squared one-step prediction error on `data`.
    ///
    /// Targets bootstrap from `reference` so two policies can be compared on
    /// identical targets.
    pub fn prediction_error(&self, reference: &Policy, data: &[Experience], discount: f64) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let total: f64 = data
            .iter()
            .map(|e| {
                let bootstrap = if e.terminal {
                    0.0
                } else {
                    reference.max_q(&e.next_state)
                };
                let target = e.reward + discount * bootstrap;
                let err = self.q_value(&e.state, e.action) - target;
                err * err
            })
            .sum();
        total / data.len() as f64
    }

    pub fn is_finite(&self) -> bool {
        self.weights.iter().flatten().all(|w| w.is_finite())
    }

    /// Write the policy as JSON, replacing any previous file atomically.
    pub fn save(&self, path: &Path) -> Result<(), PolicyError> {
        let io_err = |source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(self).map_err(|source| PolicyError::Format {
            path: path.to_path_buf(),
            source,
        })?;

        let staging = path.with_extension("json.tmp");
        fs::write(&staging, body).map_err(io_err)?;
        fs::rename(&staging, path).map_err(io_err)
    }

    pub fn load(path: &Path) -> Result<Policy, PolicyError> {
        let body = fs::read(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let policy: Policy = serde_json::from_slice(&body).map_err(|source| PolicyError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        if !policy.is_finite() {
            return Err(PolicyError::NonFinite {
                path: path.to_path_buf(),
            });
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{Dimension, Direction};
    use tempfile::TempDir;

    fn state() -> FeatureVector {
        FeatureVector([1.0, 0.8, 0.5, 0.0, 0.5, 1.0])
    }

    fn experience(action: Action, reward: f64) -> Experience {
        Experience {
            point_id: "p-1".into(),
            state: state(),
            action,
            reward,
            next_state: state(),
            terminal: true,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_greedy_prefers_noop_on_ties() {
        let policy = Policy::default();
        assert_eq!(policy.greedy(&state(), &Action::ALL), Action::NoOp);
    }

    #[test]
    fn test_greedy_picks_highest_value() {
        let grow = Action::Adjust {
            dimension: Dimension::PoolSize,
            direction: Direction::Increase,
        };
        let mut weights = [[0.0; FEATURE_COUNT]; ACTION_COUNT];
        weights[grow.index()][0] = 2.0;
        let policy = Policy::from_weights(weights);

        assert_eq!(policy.greedy(&state(), &Action::ALL), grow);
        // not a candidate: fall back to NoOp
        assert_eq!(policy.greedy(&state(), &[Action::NoOp]), Action::NoOp);
    }

    #[test]
    fn test_train_moves_value_toward_reward_and_bumps_version() {
        let policy = Policy::default();
        let batch = [experience(Action::NoOp, 1.0)];
        let refs: Vec<&Experience> = batch.iter().collect();

        let candidate = policy.train(&refs, 0.1, 0.9, Utc::now());

        assert_eq!(candidate.version(), 1);
        assert!(candidate.q_value(&state(), Action::NoOp) > 0.0);
        assert_eq!(policy, Policy::default());
        assert!(
            candidate.prediction_error(&policy, &batch, 0.9)
                < policy.prediction_error(&policy, &batch, 0.9)
        );
    }

    #[test]
    fn test_save_then_load_restores_policy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("models").join("policy.json");
        let batch = [experience(Action::NoOp, 1.0)];
        let refs: Vec<&Experience> = batch.iter().collect();
        let policy = Policy::default().train(&refs, 0.5, 0.9, Utc::now());

        policy.save(&path).unwrap();
        let loaded = Policy::load(&path).unwrap();
        assert_eq!(loaded, policy);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("policy.json");
        fs::write(&path, b"{\"version\": 1}").unwrap();
        assert!(matches!(Policy::load(&path), Err(PolicyError::Format { .. })));
    }
}
