//! Integration point records and the status lifecycle they move through.

use crate::error::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type PointId = String;

/// Health status of an integration point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Pending,
    Active,
    Degraded,
    Failed,
    Optimizing,
    Maintenance,
}

impl IntegrationStatus {
    /// The edges of the status state machine.
    pub fn can_transition_to(self, next: IntegrationStatus) -> bool {
        use IntegrationStatus::*;
        match self {
            Pending => matches!(next, Active | Optimizing | Maintenance),
            Active => matches!(next, Degraded | Optimizing | Maintenance),
            Degraded => matches!(next, Active | Failed | Optimizing | Maintenance),
            // no self-healing: only recovery or maintenance leave FAILED
            Failed => matches!(next, Pending | Maintenance),
            Optimizing => matches!(next, Pending | Active | Degraded | Failed | Maintenance),
            Maintenance => matches!(next, Pending | Active | Degraded | Failed),
        }
    }

    /// Whether the optimizer may pick actions for a point in this status.
    pub fn is_optimizable(self) -> bool {
        use IntegrationStatus::*;
        match self {
            Active | Degraded => true,
            Pending | Failed | Optimizing | Maintenance => false,
        }
    }

    /// Rank used to decide whether health got worse; higher is worse.
    pub fn severity(self) -> u8 {
        use IntegrationStatus::*;
        match self {
            Active | Optimizing | Maintenance => 0,
            Pending => 1,
            Degraded => 2,
            Failed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        use IntegrationStatus::*;
        match self {
            Pending => "pending",
            Active => "active",
            Degraded => "degraded",
            Failed => "failed",
            Optimizing => "optimizing",
            Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of ecosystem module on either side of an integration point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    DataProcessor,
    ApiGateway,
    MlModel,
    Database,
    WorkflowEngine,
    #[default]
    Custom,
}

/// The tunable operating parameters of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    pub pool_size: u32,
    #[serde(with = "nexus_config::duration")]
    pub timeout: Duration,
    #[serde(with = "nexus_config::duration")]
    pub retry_backoff: Duration,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            pool_size: 10,
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Why a status transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ThresholdsMet,
    ThresholdsBreached,
    ConsecutiveDegradedWindows,
    OptimizationStarted,
    OptimizationSettled,
    RecoveryRequested,
    MaintenanceEntered,
    MaintenanceExited,
}

/// A status change that was applied to a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub point_id: PointId,
    pub from: IntegrationStatus,
    pub to: IntegrationStatus,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// A managed connection between two ecosystem modules.
///
/// `status` can only change through [`IntegrationPoint::transition`], which
/// enforces the edges of [`IntegrationStatus::can_transition_to`]; the
/// health monitor and supervisor are the only callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationPoint {
    point_id: PointId,
    source_module: String,
    target_module: String,
    #[serde(default)]
    source_type: ModuleType,
    #[serde(default)]
    target_type: ModuleType,
    status: IntegrationStatus,
    /// Status to return to when leaving OPTIMIZING or MAINTENANCE.
    #[serde(default)]
    resume_status: Option<IntegrationStatus>,
    parameters: ConnectionParameters,
    /// Parameters in force before the action currently being evaluated.
    #[serde(default)]
    rollback_parameters: Option<ConnectionParameters>,
    #[serde(default)]
    degraded_streak: u32,
    version: u64,
    last_updated: DateTime<Utc>,
}

impl IntegrationPoint {
    pub fn new(
        point_id: impl Into<PointId>,
        source_module: impl Into<String>,
        target_module: impl Into<String>,
        parameters: ConnectionParameters,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            point_id: point_id.into(),
            source_module: source_module.into(),
            target_module: target_module.into(),
            source_type: ModuleType::Custom,
            target_type: ModuleType::Custom,
            status: IntegrationStatus::Pending,
            resume_status: None,
            parameters,
            rollback_parameters: None,
            degraded_streak: 0,
            version: 0,
            last_updated: now,
        }
    }

    pub fn with_module_types(mut self, source: ModuleType, target: ModuleType) -> Self {
        self.source_type = source;
        self.target_type = target;
        self
    }

    /// Stamp the version assigned by the store on an accepted write.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn point_id(&self) -> &str {
        &self.point_id
    }

    pub fn source_module(&self) -> &str {
        &self.source_module
    }

    pub fn target_module(&self) -> &str {
        &self.target_module
    }

    pub fn source_type(&self) -> ModuleType {
        self.source_type
    }

    pub fn target_type(&self) -> ModuleType {
        self.target_type
    }

    pub fn status(&self) -> IntegrationStatus {
        self.status
    }

    pub fn resume_status(&self) -> Option<IntegrationStatus> {
        self.resume_status
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }

    pub fn rollback_parameters(&self) -> Option<&ConnectionParameters> {
        self.rollback_parameters.as_ref()
    }

    pub fn degraded_streak(&self) -> u32 {
        self.degraded_streak
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Move to `next` if the edge exists.
    pub(crate) fn transition(
        &mut self,
        next: IntegrationStatus,
        reason: TransitionReason,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition, TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                point_id: self.point_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let from = self.status;
        self.status = next;
        self.last_updated = now;
        Ok(StatusTransition {
            point_id: self.point_id.clone(),
            from,
            to: next,
            reason,
            at: now,
        })
    }

    pub(crate) fn set_resume_status(&mut self, status: Option<IntegrationStatus>) {
        self.resume_status = status;
    }

    pub(crate) fn set_degraded_streak(&mut self, streak: u32, now: DateTime<Utc>) {
        if self.degraded_streak != streak {
            self.degraded_streak = streak;
            self.last_updated = now;
        }
    }

    /// Install a new parameter set, remembering the previous one for rollback.
    pub(crate) fn stage_parameters(&mut self, parameters: ConnectionParameters, now: DateTime<Utc>) {
        let previous = std::mem::replace(&mut self.parameters, parameters);
        self.rollback_parameters = Some(previous);
        self.last_updated = now;
    }

    /// Restore the parameters that preceded the staged action.
    pub(crate) fn roll_back_parameters(&mut self, now: DateTime<Utc>) -> Option<ConnectionParameters> {
        let previous = self.rollback_parameters.take()?;
        self.parameters = previous.clone();
        self.last_updated = now;
        Some(previous)
    }

    /// The staged parameters were kept; forget the rollback target.
    pub(crate) fn confirm_parameters(&mut self) {
        self.rollback_parameters = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IntegrationStatus::*;

    const ALL: [IntegrationStatus; 6] = [Pending, Active, Degraded, Failed, Optimizing, Maintenance];

    #[test]
    fn test_pending_never_fails_directly() {
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Degraded));
        assert!(Pending.can_transition_to(Active));
    }

    #[test]
    fn test_failed_only_leaves_through_recovery_or_maintenance() {
        let exits: Vec<_> = ALL
            .iter()
            .copied()
            .filter(|next| Failed.can_transition_to(*next))
            .collect();
        assert_eq!(exits, vec![Pending, Maintenance]);
    }

    #[test]
    fn test_no_self_loops() {
        for status in ALL {
            assert!(!status.can_transition_to(status), "{} -> {}", status, status);
        }
    }

    #[test]
    fn test_transition_rejects_missing_edge() {
        let mut point = IntegrationPoint::new(
            "p-1",
            "ingest",
            "warehouse",
            ConnectionParameters::default(),
            Utc::now(),
        );
        let err = point
            .transition(Failed, TransitionReason::ThresholdsBreached, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, Pending);
        assert_eq!(err.to, Failed);
        assert_eq!(point.status(), Pending);
    }

    #[test]
    fn test_stage_and_roll_back_parameters() {
        let now = Utc::now();
        let mut point = IntegrationPoint::new(
            "p-1",
            "ingest",
            "warehouse",
            ConnectionParameters::default(),
            now,
        );
        let bigger = ConnectionParameters {
            pool_size: 12,
            ..ConnectionParameters::default()
        };

        point.stage_parameters(bigger.clone(), now);
        assert_eq!(point.parameters(), &bigger);
        assert_eq!(point.rollback_parameters().map(|p| p.pool_size), Some(10));

        let restored = point.roll_back_parameters(now).unwrap();
        assert_eq!(restored.pool_size, 10);
        assert_eq!(point.parameters().pool_size, 10);
        assert!(point.rollback_parameters().is_none());
    }

    #[test]
    fn test_record_serializes_status_as_snake_case() {
        let point = IntegrationPoint::new(
            "p-1",
            "ingest",
            "warehouse",
            ConnectionParameters::default(),
            Utc::now(),
        )
        .with_module_types(ModuleType::DataProcessor, ModuleType::Database);

        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["source_type"], "data_processor");
        assert_eq!(json["parameters"]["timeout"], "5s");

        let back: IntegrationPoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, point);
    }
}
