//! Threshold-based health evaluation driving the status state machine.

use crate::aggregator::WindowSummary;
use crate::error::TransitionError;
use crate::model::{IntegrationPoint, IntegrationStatus, StatusTransition, TransitionReason};
use chrono::{DateTime, Utc};
use nexus_config::NexusConfig;
use std::time::Duration;
use tracing::debug;

/// The service-level thresholds a window is judged against.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub min_throughput: f64,
    pub max_latency: Duration,
    pub degraded_windows_before_failure: u32,
}

impl HealthThresholds {
    pub fn from_config(config: &NexusConfig) -> Self {
        Self {
            min_throughput: config.min_throughput,
            max_latency: config.max_latency,
            degraded_windows_before_failure: config.degraded_windows_before_failure,
        }
    }

    /// A window without data never meets the thresholds.
    pub fn met_by(&self, summary: &WindowSummary) -> bool {
        match summary.p95() {
            Some(p95) if summary.has_data() => {
                summary.throughput >= self.min_throughput && p95 <= self.max_latency
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Judge one window and move the point along the state machine.
    ///
    /// A point in OPTIMIZING is judged as if it were in the status it held
    /// before the action and always leaves OPTIMIZING here. MAINTENANCE and
    /// FAILED points are left untouched.
    pub fn evaluate(
        &self,
        point: &mut IntegrationPoint,
        summary: &WindowSummary,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, TransitionError> {
        use IntegrationStatus::*;

        let current = point.status();
        let settling = current == Optimizing;
        let base = if settling {
            match point.resume_status() {
                Some(status @ (Pending | Active | Degraded)) => status,
                _ => Active,
            }
        } else {
            current
        };

        let healthy = self.thresholds.met_by(summary);
        let limit = self.thresholds.degraded_windows_before_failure.max(1);
        let streak = point.degraded_streak();

        let (target, reason, next_streak) = match base {
            Pending if healthy && summary.error_rate == 0.0 => {
                (Active, TransitionReason::ThresholdsMet, 0)
            }
            Pending => (Pending, TransitionReason::OptimizationSettled, 0),
            Active if healthy => (Active, TransitionReason::OptimizationSettled, 0),
            Active => (Degraded, TransitionReason::ThresholdsBreached, 1),
            Degraded if healthy => (Active, TransitionReason::ThresholdsMet, 0),
            Degraded if streak + 1 >= limit => {
                (Failed, TransitionReason::ConsecutiveDegradedWindows, streak + 1)
            }
            Degraded => (Degraded, TransitionReason::OptimizationSettled, streak + 1),
            Failed | Maintenance | Optimizing => {
                debug!(
                    point_id = %point.point_id(),
                    status = %current,
                    "Health evaluation leaves status unchanged"
                );
                return Ok(None);
            }
        };

        point.set_degraded_streak(next_streak, now);

        if settling {
            point.set_resume_status(None);
            let reason = if target == base {
                TransitionReason::OptimizationSettled
            } else {
                reason
            };
            return point.transition(target, reason, now).map(Some);
        }

        if target == current {
            return Ok(None);
        }
        point.transition(target, reason, now).map(Some)
    }

    /// Mark the point as having an action in flight.
    pub fn begin_optimizing(
        &self,
        point: &mut IntegrationPoint,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition, TransitionError> {
        let previous = point.status();
        let transition =
            point.transition(IntegrationStatus::Optimizing, TransitionReason::OptimizationStarted, now)?;
        point.set_resume_status(Some(previous));
        Ok(transition)
    }

    /// Enter MAINTENANCE. An in-flight action is abandoned: its staged
    /// parameters are rolled back and the point resumes from the status it
    /// had before optimizing.
    pub fn enter_maintenance(
        &self,
        point: &mut IntegrationPoint,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition, TransitionError> {
        let previous = point.status();
        let resume = match previous {
            IntegrationStatus::Optimizing => point.resume_status().unwrap_or(IntegrationStatus::Active),
            status => status,
        };
        let transition =
            point.transition(IntegrationStatus::Maintenance, TransitionReason::MaintenanceEntered, now)?;
        if previous == IntegrationStatus::Optimizing {
            point.roll_back_parameters(now);
        }
        point.set_resume_status(Some(resume));
        Ok(transition)
    }

    /// Leave MAINTENANCE for the status the point was in when it entered.
    pub fn exit_maintenance(
        &self,
        point: &mut IntegrationPoint,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition, TransitionError> {
        use IntegrationStatus::*;

        if point.status() != Maintenance {
            return Err(TransitionError {
                point_id: point.point_id().to_string(),
                from: point.status(),
                to: point.resume_status().unwrap_or(Pending),
            });
        }
        let resume = match point.resume_status() {
            Some(status @ (Pending | Active | Degraded | Failed)) => status,
            _ => Pending,
        };
        let transition = point.transition(resume, TransitionReason::MaintenanceExited, now)?;
        point.set_resume_status(None);
        Ok(transition)
    }

    /// Explicit recovery: FAILED back to PENDING.
    pub fn recover(
        &self,
        point: &mut IntegrationPoint,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition, TransitionError> {
        if point.status() != IntegrationStatus::Failed {
            return Err(TransitionError {
                point_id: point.point_id().to_string(),
                from: point.status(),
                to: IntegrationStatus::Pending,
            });
        }
        let transition =
            point.transition(IntegrationStatus::Pending, TransitionReason::RecoveryRequested, now)?;
        point.set_degraded_streak(0, now);
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::LatencyPercentiles;
    use crate::model::ConnectionParameters;
    use IntegrationStatus::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthThresholds {
            min_throughput: 100.0,
            max_latency: Duration::from_secs(2),
            degraded_windows_before_failure: 3,
        })
    }

    fn point() -> IntegrationPoint {
        IntegrationPoint::new("p-1", "a", "b", ConnectionParameters::default(), Utc::now())
    }

    fn window(throughput: f64, p95_ms: u64, error_rate: f64) -> WindowSummary {
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
            sample_count: 100,
        }
    }

    fn empty_window() -> WindowSummary {
        WindowSummary {
            point_id: "p-1".into(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            throughput: 0.0,
            latency: None,
            error_rate: 0.0,
            sample_count: 0,
        }
    }

    #[test]
    fn test_pending_needs_zero_errors_to_activate() {
        let monitor = monitor();
        let mut p = point();

        let t = monitor.evaluate(&mut p, &window(150.0, 500, 0.01), Utc::now()).unwrap();
        assert!(t.is_none());
        assert_eq!(p.status(), Pending);

        let t = monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap();
        assert_eq!(t.map(|t| t.to), Some(Active));
    }

    #[test]
    fn test_empty_window_never_activates() {
        let monitor = monitor();
        let mut p = point();
        assert!(monitor.evaluate(&mut p, &empty_window(), Utc::now()).unwrap().is_none());
        assert_eq!(p.status(), Pending);
    }

    #[test]
    fn test_degraded_recovers_and_resets_streak() {
        let monitor = monitor();
        let mut p = point();
        monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap();
        monitor.evaluate(&mut p, &window(10.0, 500, 0.0), Utc::now()).unwrap();
        monitor.evaluate(&mut p, &window(10.0, 500, 0.0), Utc::now()).unwrap();
        assert_eq!(p.status(), Degraded);
        assert_eq!(p.degraded_streak(), 2);

        monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap();
        assert_eq!(p.status(), Active);
        assert_eq!(p.degraded_streak(), 0);
    }

    #[test]
    fn test_failed_is_sticky_until_recovered() {
        let monitor = monitor();
        let mut p = point();
        monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap();
        for _ in 0..3 {
            monitor.evaluate(&mut p, &window(10.0, 500, 0.0), Utc::now()).unwrap();
        }
        assert_eq!(p.status(), Failed);

        assert!(monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap().is_none());
        assert_eq!(p.status(), Failed);

        let t = monitor.recover(&mut p, Utc::now()).unwrap();
        assert_eq!((t.from, t.to), (Failed, Pending));
        assert_eq!(p.degraded_streak(), 0);
    }

    #[test]
    fn test_optimizing_always_settles() {
        let monitor = monitor();
        let mut p = point();
        monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap();
        monitor.begin_optimizing(&mut p, Utc::now()).unwrap();
        assert_eq!(p.status(), Optimizing);

        let t = monitor
            .evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!((t.from, t.to), (Optimizing, Active));
        assert_eq!(t.reason, TransitionReason::OptimizationSettled);
        assert!(p.resume_status().is_none());
    }

    #[test]
    fn test_maintenance_returns_to_entry_status() {
        let monitor = monitor();
        let mut p = point();
        monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap();
        monitor.evaluate(&mut p, &window(10.0, 500, 0.0), Utc::now()).unwrap();
        assert_eq!(p.status(), Degraded);

        monitor.enter_maintenance(&mut p, Utc::now()).unwrap();
        assert!(monitor.evaluate(&mut p, &window(10.0, 500, 0.0), Utc::now()).unwrap().is_none());
        assert_eq!(p.status(), Maintenance);

        let t = monitor.exit_maintenance(&mut p, Utc::now()).unwrap();
        assert_eq!(t.to, Degraded);
    }

    #[test]
    fn test_maintenance_during_optimizing_rolls_back_staged_parameters() {
        let monitor = monitor();
        let mut p = point();
        monitor.evaluate(&mut p, &window(150.0, 500, 0.0), Utc::now()).unwrap();
        let before = p.parameters().clone();
        monitor.begin_optimizing(&mut p, Utc::now()).unwrap();
        let staged = ConnectionParameters {
            pool_size: before.pool_size + 1,
            ..before.clone()
        };
        p.stage_parameters(staged, Utc::now());

        let t = monitor.enter_maintenance(&mut p, Utc::now()).unwrap();
        assert_eq!((t.from, t.to), (Optimizing, Maintenance));
        assert_eq!(p.parameters(), &before);
        assert!(p.rollback_parameters().is_none());

        let t = monitor.exit_maintenance(&mut p, Utc::now()).unwrap();
        assert_eq!(t.to, Active);
    }

    #[test]
    fn test_recover_rejects_healthy_point() {
        let monitor = monitor();
        let mut p = point();
        let err = monitor.recover(&mut p, Utc::now()).unwrap_err();
        assert_eq!(err.from, Pending);
    }
}
