//! Action selection, reward shaping and policy retraining.
//!
//! The optimizer is epsilon-greedy over a small discrete action space: keep
//! the parameters, or nudge one of pool size, timeout or retry backoff by one
//! step. Random exploration only happens while a point is underperforming so
//! a healthy point is never perturbed for curiosity's sake.

use crate::aggregator::WindowSummary;
use crate::error::TrainingError;
use crate::experience::Experience;
use crate::model::{ConnectionParameters, IntegrationStatus};
use crate::policy::{FeatureVector, Policy, PolicyError};
use chrono::{DateTime, Utc};
use nexus_config::{NexusConfig, RewardWeights};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ACTION_COUNT: usize = 7;

/// Upper clamp for throughput and latency ratios in features and reward.
const RATIO_CAP: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    PoolSize,
    Timeout,
    RetryBackoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
}

/// A discrete parameter adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Adjust {
        dimension: Dimension,
        direction: Direction,
    },
}

impl Action {
    pub const ALL: [Action; ACTION_COUNT] = [
        Action::NoOp,
        Action::adjust(Dimension::PoolSize, Direction::Increase),
        Action::adjust(Dimension::PoolSize, Direction::Decrease),
        Action::adjust(Dimension::Timeout, Direction::Increase),
        Action::adjust(Dimension::Timeout, Direction::Decrease),
        Action::adjust(Dimension::RetryBackoff, Direction::Increase),
        Action::adjust(Dimension::RetryBackoff, Direction::Decrease),
    ];

    pub const fn adjust(dimension: Dimension, direction: Direction) -> Self {
        Action::Adjust {
            dimension,
            direction,
        }
    }

    /// Stable position in [`Action::ALL`] and in the policy weight table.
    pub fn index(self) -> usize {
        use Dimension::*;
        use Direction::*;
        match self {
            Action::NoOp => 0,
            Action::Adjust { dimension, direction } => {
                let base = match dimension {
                    PoolSize => 1,
                    Timeout => 3,
                    RetryBackoff => 5,
                };
                match direction {
                    Increase => base,
                    Decrease => base + 1,
                }
            }
        }
    }

    pub fn is_noop(self) -> bool {
        matches!(self, Action::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::NoOp => f.write_str("noop"),
            Action::Adjust { dimension, direction } => {
                let dim = match dimension {
                    Dimension::PoolSize => "pool_size",
                    Dimension::Timeout => "timeout",
                    Dimension::RetryBackoff => "retry_backoff",
                };
                let sign = match direction {
                    Direction::Increase => '+',
                    Direction::Decrease => '-',
                };
                write!(f, "{}{}", dim, sign)
            }
        }
    }
}

/// Legal range and step size for every tunable dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBounds {
    pub pool_size_min: u32,
    pub pool_size_max: u32,
    pub pool_size_step: u32,
    pub timeout_min: Duration,
    pub timeout_max: Duration,
    pub timeout_step: Duration,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    pub retry_backoff_step: Duration,
}

impl ActionBounds {
    pub fn from_config(config: &NexusConfig) -> Self {
        let b = &config.bounds;
        Self {
            pool_size_min: b.pool_size_min,
            pool_size_max: config.max_connection_pool,
            pool_size_step: b.pool_size_step,
            timeout_min: b.timeout_min,
            timeout_max: b.timeout_max,
            timeout_step: b.timeout_step,
            retry_backoff_min: b.retry_backoff_min,
            retry_backoff_max: b.retry_backoff_max,
            retry_backoff_step: b.retry_backoff_step,
        }
    }

    /// Parameters after `action`, or `None` if the result would leave bounds.
    pub fn apply(
        &self,
        params: &ConnectionParameters,
        action: Action,
    ) -> Option<ConnectionParameters> {
        let (dimension, direction) = match action {
            Action::NoOp => return Some(params.clone()),
            Action::Adjust { dimension, direction } => (dimension, direction),
        };

        let mut next = params.clone();
        match dimension {
            Dimension::PoolSize => {
                if self.pool_size_step == 0 {
                    return None;
                }
                next.pool_size = match direction {
                    Direction::Increase => params.pool_size.checked_add(self.pool_size_step)?,
                    Direction::Decrease => params.pool_size.checked_sub(self.pool_size_step)?,
                };
                if next.pool_size < self.pool_size_min || next.pool_size > self.pool_size_max {
                    return None;
                }
            }
            Dimension::Timeout => {
                next.timeout = step(
                    params.timeout,
                    self.timeout_step,
                    self.timeout_min,
                    self.timeout_max,
                    direction,
                )?;
            }
            Dimension::RetryBackoff => {
                next.retry_backoff = step(
                    params.retry_backoff,
                    self.retry_backoff_step,
                    self.retry_backoff_min,
                    self.retry_backoff_max,
                    direction,
                )?;
            }
        }
        Some(next)
    }

    /// Actions whose result stays in bounds; `NoOp` is always first.
    pub fn valid_actions(&self, params: &ConnectionParameters) -> Vec<Action> {
        Action::ALL
            .iter()
            .copied()
            .filter(|a| self.apply(params, *a).is_some())
            .collect()
    }
}

fn step(
    value: Duration,
    step: Duration,
    min: Duration,
    max: Duration,
    direction: Direction,
) -> Option<Duration> {
    if step.is_zero() {
        return None;
    }
    let next = match direction {
        Direction::Increase => value.checked_add(step)?,
        Direction::Decrease => value.checked_sub(step)?,
    };
    (next >= min && next <= max).then_some(next)
}

/// Turns window summaries into rewards.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardModel {
    pub weights: RewardWeights,
    pub min_throughput: f64,
    pub max_latency: Duration,
}

impl RewardModel {
    pub fn from_config(config: &NexusConfig) -> Self {
        Self {
            weights: config.reward.clone(),
            min_throughput: config.min_throughput,
            max_latency: config.max_latency,
        }
    }

    pub fn throughput_ratio(&self, summary: &WindowSummary) -> f64 {
        if self.min_throughput <= 0.0 {
            return RATIO_CAP;
        }
        (summary.throughput / self.min_throughput).clamp(0.0, RATIO_CAP)
    }

    /// p95 over the latency threshold; a window without data counts as worst case.
    pub fn latency_ratio(&self, summary: &WindowSummary) -> f64 {
        let max = self.max_latency.as_secs_f64();
        match summary.p95() {
            Some(p95) if max > 0.0 => (p95.as_secs_f64() / max).clamp(0.0, RATIO_CAP),
            _ => RATIO_CAP,
        }
    }

    /// Reward for the window that followed an action.
    ///
    /// Any move to a worse status costs `status_penalty`, which config
    /// validation keeps above the largest possible throughput term.
    pub fn reward(
        &self,
        summary: &WindowSummary,
        before: IntegrationStatus,
        after: IntegrationStatus,
    ) -> f64 {
        let w = &self.weights;
        let mut reward = w.throughput_weight * self.throughput_ratio(summary)
            - w.latency_weight * self.latency_ratio(summary)
            - w.error_weight * summary.error_rate;
        if after.severity() > before.severity() {
            reward -= w.status_penalty;
        }
        reward
    }

    pub fn rollback_reward(&self, reward: f64) -> f64 {
        reward - self.weights.rollback_penalty
    }
}

/// Learning and exploration knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    pub discount: f64,
    pub exploration_rate: f64,
    pub exploration_decay: f64,
    pub min_exploration_rate: f64,
    pub batch_size: usize,
    pub validation_fraction: f64,
    pub performance_threshold: f64,
    pub seed: Option<u64>,
    /// Where accepted policies are written; `None` keeps them in memory only.
    pub model_path: Option<PathBuf>,
}

impl OptimizerSettings {
    pub fn from_config(config: &NexusConfig) -> Self {
        Self {
            learning_rate: config.rl_learning_rate,
            discount: config.rl_discount_factor,
            exploration_rate: config.rl_exploration_rate,
            exploration_decay: config.rl_exploration_decay,
            min_exploration_rate: config.rl_min_exploration_rate,
            batch_size: config.rl_batch_size,
            validation_fraction: config.rl_validation_fraction,
            performance_threshold: config.performance_threshold,
            seed: config.rng_seed,
            model_path: Some(config.ml_model_path.clone()),
        }
    }
}

/// Outcome of an accepted retrain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainReport {
    pub previous_version: u64,
    pub policy_version: u64,
    pub batch_size: usize,
    pub validation_size: usize,
    /// Estimated average reward on the held-back slice.
    pub current_reward: f64,
    pub candidate_reward: f64,
    /// Mean squared one-step prediction error on the same slice.
    pub current_error: f64,
    pub candidate_error: f64,
    pub exploration_rate: f64,
    pub persisted: bool,
}

#[derive(Debug)]
struct Exploration {
    rng: StdRng,
    rate: f64,
}

#[derive(Debug)]
pub struct Optimizer {
    settings: OptimizerSettings,
    bounds: ActionBounds,
    reward: RewardModel,
    max_pool: u32,
    /// Readers clone the inner `Arc`; a retrain swaps it under a brief write lock.
    policy: RwLock<Arc<Policy>>,
    exploration: Mutex<Exploration>,
}

impl Optimizer {
    pub fn new(
        settings: OptimizerSettings,
        bounds: ActionBounds,
        reward: RewardModel,
        policy: Policy,
    ) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let rate = settings.exploration_rate;
        Self {
            max_pool: bounds.pool_size_max.max(1),
            settings,
            bounds,
            reward,
            policy: RwLock::new(Arc::new(policy)),
            exploration: Mutex::new(Exploration { rng, rate }),
        }
    }

    /// Build from config, resuming from the persisted policy when there is one.
    pub fn from_config(config: &NexusConfig) -> Self {
        let settings = OptimizerSettings::from_config(config);
        let policy = match &settings.model_path {
            Some(path) if path.exists() => match Policy::load(path) {
                Ok(policy) => {
                    info!(
                        path = %path.display(),
                        version = policy.version(),
                        "Loaded persisted policy"
                    );
                    policy
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable policy file, starting fresh");
                    Policy::default()
                }
            },
            _ => Policy::default(),
        };
        Self::new(
            settings,
            ActionBounds::from_config(config),
            RewardModel::from_config(config),
            policy,
        )
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn bounds(&self) -> &ActionBounds {
        &self.bounds
    }

    pub fn reward_model(&self) -> &RewardModel {
        &self.reward
    }

    /// The policy currently in force.
    pub fn policy(&self) -> Arc<Policy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn exploration_rate(&self) -> f64 {
        self.exploration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rate
    }

    pub fn features(&self, summary: &WindowSummary, params: &ConnectionParameters) -> FeatureVector {
        let has_data = summary.has_data();
        let latency = if has_data {
            self.reward.latency_ratio(summary)
        } else {
            0.0
        };
        FeatureVector([
            1.0,
            self.reward.throughput_ratio(summary),
            latency,
            summary.error_rate.clamp(0.0, 1.0),
            (params.pool_size as f64 / self.max_pool as f64).clamp(0.0, 1.0),
            if has_data { 1.0 } else { 0.0 },
        ])
    }

    /// Score in `[0, 1]`; 1 means every threshold is met with no errors.
    pub fn performance_score(&self, summary: &WindowSummary) -> f64 {
        if !summary.has_data() {
            return 0.0;
        }
        let throughput = self.reward.throughput_ratio(summary).min(1.0);
        let latency = match summary.p95() {
            Some(p95) if !p95.is_zero() => {
                (self.reward.max_latency.as_secs_f64() / p95.as_secs_f64()).min(1.0)
            }
            _ => 1.0,
        };
        throughput * latency * (1.0 - summary.error_rate.clamp(0.0, 1.0))
    }

    /// Whether a window scores below the configured performance threshold.
    pub fn below_threshold(&self, summary: &WindowSummary) -> bool {
        self.performance_score(summary) < self.settings.performance_threshold
    }

    /// Pick the next action for a point, epsilon-greedy.
    ///
    /// Non-optimizable statuses always get `NoOp`. With probability
    /// `exploration_rate` a uniformly random valid action is taken; otherwise
    /// the policy's highest-valued valid action.
    pub fn select_action(
        &self,
        status: IntegrationStatus,
        summary: &WindowSummary,
        params: &ConnectionParameters,
    ) -> Action {
        if !status.is_optimizable() {
            return Action::NoOp;
        }

        let candidates = self.bounds.valid_actions(params);
        let state = self.features(summary, params);

        {
            let mut exploration = self.exploration.lock().unwrap_or_else(PoisonError::into_inner);
            let Exploration { rng, rate } = &mut *exploration;
            if rng.gen::<f64>() < *rate {
                if let Some(action) = candidates.choose(rng) {
                    debug!(point_id = %summary.point_id, action = %action, "Exploring");
                    return *action;
                }
            }
        }

        self.policy().greedy(&state, &candidates)
    }

    pub fn apply_action(
        &self,
        params: &ConnectionParameters,
        action: Action,
    ) -> Option<ConnectionParameters> {
        self.bounds.apply(params, action)
    }

    pub fn reward(
        &self,
        summary: &WindowSummary,
        before: IntegrationStatus,
        after: IntegrationStatus,
    ) -> f64 {
        self.reward.reward(summary, before, after)
    }

    pub fn rollback_reward(&self, reward: f64) -> f64 {
        self.reward.rollback_reward(reward)
    }

    /// Train a candidate on a sample of `experiences` and swap it in if its
    /// estimated average reward on the held-back most recent slice is not
    /// worse than the current policy's.
    ///
    /// CPU bound; run it off the async workers. On any error the current
    /// policy is left exactly as it was.
    pub fn retrain(
        &self,
        experiences: &[Experience],
        now: DateTime<Utc>,
    ) -> Result<RetrainReport, TrainingError> {
        let s = &self.settings;
        let fraction = s.validation_fraction.clamp(0.0, 0.9);
        let holdback = ((experiences.len() as f64 * fraction).ceil() as usize).max(1);
        let need = s.batch_size + holdback;
        if s.batch_size == 0 || experiences.len() < need {
            return Err(TrainingError::InsufficientExperience {
                have: experiences.len(),
                need,
            });
        }

        let (training, validation) = experiences.split_at(experiences.len() - holdback);
        let indices = {
            let mut exploration = self.exploration.lock().unwrap_or_else(PoisonError::into_inner);
            rand::seq::index::sample(&mut exploration.rng, training.len(), s.batch_size)
        };
        let batch: Vec<&Experience> = indices.iter().map(|i| &training[i]).collect();

        let current = self.policy();
        let candidate = current.train(&batch, s.learning_rate, s.discount, now);
        if !candidate.is_finite() {
            return Err(TrainingError::Diverged);
        }

        let current_reward = current.estimated_reward(validation);
        let candidate_reward = candidate.estimated_reward(validation);
        let current_error = current.prediction_error(&current, validation, s.discount);
        let candidate_error = candidate.prediction_error(&current, validation, s.discount);
        if !candidate_reward.is_finite() || !candidate_error.is_finite() {
            return Err(TrainingError::Diverged);
        }
        if candidate_reward < current_reward {
            return Err(TrainingError::ValidationRejected {
                candidate_reward,
                current_reward,
                candidate_error,
                current_error,
            });
        }

        let candidate = Arc::new(candidate);
        {
            let mut slot = self.policy.write().unwrap_or_else(PoisonError::into_inner);
            if slot.version() != current.version() {
                return Err(TrainingError::Superseded {
                    expected: current.version(),
                    found: slot.version(),
                });
            }
            *slot = candidate.clone();
        }

        let exploration_rate = {
            let mut exploration = self.exploration.lock().unwrap_or_else(PoisonError::into_inner);
            exploration.rate = (exploration.rate * s.exploration_decay).max(s.min_exploration_rate);
            exploration.rate
        };

        let persisted = match self.persist(&candidate) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "Accepted policy could not be persisted");
                false
            }
        };

        Ok(RetrainReport {
            previous_version: current.version(),
            policy_version: candidate.version(),
            batch_size: batch.len(),
            validation_size: validation.len(),
            current_reward,
            candidate_reward,
            current_error,
            candidate_error,
            exploration_rate,
            persisted,
        })
    }

    fn persist(&self, policy: &Policy) -> Result<bool, PolicyError> {
        match &self.settings.model_path {
            Some(path) => policy.save(path).map(|_| true),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::LatencyPercentiles;
    use crate::policy::FEATURE_COUNT;

    fn settings(exploration_rate: f64) -> OptimizerSettings {
        let mut settings = OptimizerSettings::from_config(&NexusConfig::default());
        settings.exploration_rate = exploration_rate;
        settings.exploration_decay = 0.9;
        settings.seed = Some(7);
        settings.model_path = None;
        settings
    }

    fn optimizer(exploration_rate: f64) -> Optimizer {
        let config = NexusConfig::default();
        Optimizer::new(
            settings(exploration_rate),
            ActionBounds::from_config(&config),
            RewardModel::from_config(&config),
            Policy::default(),
        )
    }

    fn summary(throughput: f64, p95_ms: u64, error_rate: f64) -> WindowSummary {
        let p95 = Duration::from_millis(p95_ms);
        WindowSummary {
            point_id: "p-1".into(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            throughput,
            latency: Some(LatencyPercentiles {
                p50: p95,
                p95,
                p99: p95,
            }),
            error_rate,
            sample_count: 10,
        }
    }

    fn params(pool_size: u32) -> ConnectionParameters {
        ConnectionParameters {
            pool_size,
            ..ConnectionParameters::default()
        }
    }

    #[test]
    fn test_action_indices_match_table_order() {
        for (i, action) in Action::ALL.iter().enumerate() {
            assert_eq!(action.index(), i);
        }
    }

    #[test]
    fn test_pool_actions_respect_bounds() {
        let config = NexusConfig::default();
        let bounds = ActionBounds::from_config(&config);
        let grow = Action::adjust(Dimension::PoolSize, Direction::Increase);
        let shrink = Action::adjust(Dimension::PoolSize, Direction::Decrease);

        assert!(bounds.apply(&params(config.max_connection_pool), grow).is_none());
        assert!(bounds.apply(&params(1), shrink).is_none());
        assert_eq!(bounds.apply(&params(10), grow).unwrap().pool_size, 11);

        let valid = bounds.valid_actions(&params(1));
        assert_eq!(valid[0], Action::NoOp);
        assert!(!valid.contains(&shrink));
    }

    #[test]
    fn test_duration_actions_respect_bounds() {
        let bounds = ActionBounds::from_config(&NexusConfig::default());
        let at_max = ConnectionParameters {
            timeout: bounds.timeout_max,
            ..ConnectionParameters::default()
        };
        let longer = Action::adjust(Dimension::Timeout, Direction::Increase);
        assert!(bounds.apply(&at_max, longer).is_none());

        let shorter = Action::adjust(Dimension::Timeout, Direction::Decrease);
        let next = bounds.apply(&at_max, shorter).unwrap();
        assert_eq!(next.timeout, bounds.timeout_max - bounds.timeout_step);
    }

    #[test]
    fn test_non_optimizable_status_gets_noop() {
        let optimizer = optimizer(1.0);
        for status in [
            IntegrationStatus::Pending,
            IntegrationStatus::Failed,
            IntegrationStatus::Optimizing,
            IntegrationStatus::Maintenance,
        ] {
            let action = optimizer.select_action(status, &summary(10.0, 5000, 0.5), &params(10));
            assert_eq!(action, Action::NoOp);
        }
    }

    #[test]
    fn test_full_exploration_explores_healthy_points_too() {
        let optimizer = optimizer(1.0);
        let mut non_noop = 0;
        for _ in 0..200 {
            let action = optimizer.select_action(
                IntegrationStatus::Active,
                &summary(200.0, 100, 0.0),
                &params(10),
            );
            if !action.is_noop() {
                non_noop += 1;
            }
        }
        // 6 of the 7 valid actions change something
        assert!(non_noop > 100, "explored {} times", non_noop);
    }

    #[test]
    fn test_zero_exploration_is_greedy() {
        let optimizer = optimizer(0.0);
        for _ in 0..20 {
            let action = optimizer.select_action(
                IntegrationStatus::Degraded,
                &summary(10.0, 5000, 0.2),
                &params(10),
            );
            assert_eq!(action, Action::NoOp);
        }
    }

    #[test]
    fn test_degraded_point_explores_within_bounds() {
        let optimizer = optimizer(1.0);
        let max = NexusConfig::default().max_connection_pool;
        let mut non_noop = 0;
        for _ in 0..50 {
            let action = optimizer.select_action(
                IntegrationStatus::Degraded,
                &summary(10.0, 5000, 0.2),
                &params(max),
            );
            assert_ne!(action, Action::adjust(Dimension::PoolSize, Direction::Increase));
            if !action.is_noop() {
                non_noop += 1;
            }
        }
        assert!(non_noop > 0);
    }

    #[test]
    fn test_reward_penalizes_worsening_status() {
        let model = RewardModel::from_config(&NexusConfig::default());
        let window = summary(150.0, 500, 0.0);

        let steady = model.reward(&window, IntegrationStatus::Active, IntegrationStatus::Active);
        let worse = model.reward(&window, IntegrationStatus::Active, IntegrationStatus::Degraded);
        assert!(steady > 0.0);
        assert_eq!(worse, steady - model.weights.status_penalty);

        // best possible throughput cannot buy back a worsening
        let best = summary(1_000_000.0, 500, 0.0);
        let worst = summary(0.0, 500, 0.0);
        assert!(
            model.reward(&best, IntegrationStatus::Active, IntegrationStatus::Degraded)
                < model.reward(&worst, IntegrationStatus::Active, IntegrationStatus::Active)
        );
    }

    #[test]
    fn test_performance_score() {
        let optimizer = optimizer(0.0);
        assert_eq!(optimizer.performance_score(&summary(200.0, 100, 0.0)), 1.0);
        let halved = optimizer.performance_score(&summary(50.0, 100, 0.0));
        assert!((halved - 0.5).abs() < 1e-9);
        let mut empty = summary(0.0, 100, 0.0);
        empty.sample_count = 0;
        empty.latency = None;
        assert_eq!(optimizer.performance_score(&empty), 0.0);
        assert!(optimizer.below_threshold(&empty));
        assert!(!optimizer.below_threshold(&summary(200.0, 100, 0.0)));
    }

    fn experiences(rewards: &[f64]) -> Vec<Experience> {
        rewards
            .iter()
            .map(|r| Experience {
                point_id: "p-1".into(),
                state: FeatureVector([1.0, 1.0, 0.25, 0.0, 0.1, 1.0]),
                action: Action::NoOp,
                reward: *r,
                next_state: FeatureVector([1.0, 1.0, 0.25, 0.0, 0.1, 1.0]),
                terminal: true,
                recorded_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_retrain_requires_enough_experience() {
        let optimizer = optimizer(0.1);
        let err = optimizer.retrain(&experiences(&[1.0; 4]), Utc::now()).unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientExperience { have: 4, .. }));
    }

    #[test]
    fn test_accepted_retrain_swaps_policy_and_decays_exploration() {
        let optimizer = optimizer(0.5);
        let batch = optimizer.settings().batch_size;
        let data = experiences(&vec![1.0; batch * 2]);

        let report = optimizer.retrain(&data, Utc::now()).unwrap();

        assert_eq!(report.previous_version, 0);
        assert_eq!(report.policy_version, 1);
        assert!(report.candidate_reward >= report.current_reward);
        assert!(report.candidate_error <= report.current_error);
        assert_eq!(optimizer.policy().version(), 1);
        assert!(optimizer.exploration_rate() < 0.5);
        assert!(!report.persisted);
    }

    #[test]
    fn test_divergent_candidate_is_discarded() {
        let config = NexusConfig::default();
        let mut s = settings(0.1);
        s.learning_rate = 1.0;
        let mut weights = [[0.0; FEATURE_COUNT]; ACTION_COUNT];
        weights[0] = [f64::MAX; FEATURE_COUNT];
        let start = Policy::from_weights(weights);
        let optimizer = Optimizer::new(
            s,
            ActionBounds::from_config(&config),
            RewardModel::from_config(&config),
            start.clone(),
        );
        let data = experiences(&vec![1.0; optimizer.settings().batch_size * 2]);

        let err = optimizer.retrain(&data, Utc::now()).unwrap_err();
        assert_eq!(err, TrainingError::Diverged);
        assert_eq!(*optimizer.policy(), start);
    }
}
