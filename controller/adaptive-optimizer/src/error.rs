//! Error taxonomy for the optimizer engine.
//!
//! Only configuration errors are fatal; everything here is recovered or
//! reported at the scope of a single integration point.

use crate::model::{IntegrationStatus, PointId};
use std::time::Duration;
use thiserror::Error;

/// Failures from the integration-record store collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Integration point not found: {point_id}")]
    NotFound { point_id: PointId },

    #[error("Version conflict for {point_id}: expected {expected}, store has {actual}")]
    Conflict {
        point_id: PointId,
        expected: u64,
        actual: u64,
    },

    #[error("Transient store failure: {message}")]
    Transient { message: String },

    #[error("Store operation {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Failed to encode or decode record: {message}")]
    Serialization { message: String },
}

impl StoreError {
    /// Transient failures and timeouts are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. } | StoreError::Timeout { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Connection pool failures. `Saturated` is backpressure, not ill health.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Pool for {point_id} saturated; waited {waited:?} for a slot")]
    Saturated { point_id: PointId, waited: Duration },

    #[error("No pool registered for point: {0}")]
    UnknownPoint(PointId),

    #[error("Pool size {requested} for {point_id} outside 1..={maximum}")]
    ExceedsMaximum {
        point_id: PointId,
        requested: u32,
        maximum: u32,
    },
}

/// Non-fatal retrain failures; the current policy stays in force.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("Not enough experience to retrain: have {have}, need {need}")]
    InsufficientExperience { have: usize, need: usize },

    #[error("Candidate policy diverged (non-finite weights)")]
    Diverged,

    #[error(
        "Candidate policy rejected: estimated reward {candidate_reward:.6} < current {current_reward:.6}"
    )]
    ValidationRejected {
        candidate_reward: f64,
        current_reward: f64,
        candidate_error: f64,
        current_error: f64,
    },

    #[error("Policy changed during training (expected version {expected}, found {found})")]
    Superseded { expected: u64, found: u64 },

    #[error("Training task aborted: {message}")]
    Aborted { message: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Illegal status transition {from} -> {to} for point {point_id}")]
pub struct TransitionError {
    pub point_id: PointId,
    pub from: IntegrationStatus,
    pub to: IntegrationStatus,
}

/// Failures of externally requested control operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Point {0} is not managed by this supervisor")]
    UnknownPoint(PointId),

    #[error("Point {0} is already managed by this supervisor")]
    AlreadyManaged(PointId),

    #[error("Controller for {0} has stopped")]
    ControllerStopped(PointId),
}
