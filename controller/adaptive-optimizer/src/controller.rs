//! Per-point control loop.
//!
//! Each health-check tick a controller closes every elapsed metrics window
//! for its point and, per window:
//!
//! 1. evaluates health and moves the status machine,
//! 2. resolves the action taken one window earlier into a reward and an
//!    experience, rolling parameters back if the point ended up FAILED,
//! 3. lets the optimizer pick the next action for ACTIVE and DEGRADED points,
//! 4. persists the record with an optimistic version check, and only then
//!    applies new parameters to the pool and emits events.
//!
//! A version conflict re-reads the record and re-plans once; a second
//! failure skips the window for this point only.

use crate::aggregator::{AggregatorSettings, MetricsAggregator, WindowSummary};
use crate::error::{ControlError, StoreError, TransitionError};
use crate::events::{EventSink, ObservabilityEvent};
use crate::experience::{Experience, ExperienceRecorder, ExperienceStore};
use crate::health::{HealthMonitor, HealthThresholds};
use crate::model::{
    ConnectionParameters, IntegrationPoint, IntegrationStatus, PointId, StatusTransition,
};
use crate::optimizer::{Action, Optimizer};
use crate::policy::FeatureVector;
use crate::pool::ConnectionPoolManager;
use crate::store::{IntegrationStore, StoreClient};
use chrono::{DateTime, Utc};
use nexus_config::NexusConfig;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const EXPERIENCE_QUEUE_DEPTH: usize = 1024;

/// Components shared by every controller in a fleet.
#[derive(Clone)]
pub struct ControllerContext {
    pub config: Arc<NexusConfig>,
    pub aggregator: Arc<MetricsAggregator>,
    pub health: Arc<HealthMonitor>,
    pub optimizer: Arc<Optimizer>,
    pub pool: Arc<ConnectionPoolManager>,
    pub store: StoreClient,
    pub experiences: ExperienceRecorder,
    pub events: Arc<dyn EventSink>,
}

impl ControllerContext {
    /// Wire up every component from config. Spawns the experience recorder,
    /// so it must run inside a Tokio runtime.
    pub fn build(
        config: NexusConfig,
        store: Arc<dyn IntegrationStore>,
        events: Arc<dyn EventSink>,
    ) -> (Self, Arc<ExperienceStore>) {
        let experience_store = Arc::new(ExperienceStore::new(config.rl_memory_capacity));
        let (experiences, _recorder) =
            ExperienceRecorder::spawn(experience_store.clone(), EXPERIENCE_QUEUE_DEPTH);

        let context = Self {
            aggregator: Arc::new(MetricsAggregator::new(AggregatorSettings::from_config(
                &config,
            ))),
            health: Arc::new(HealthMonitor::new(HealthThresholds::from_config(&config))),
            optimizer: Arc::new(Optimizer::from_config(&config)),
            pool: Arc::new(
                ConnectionPoolManager::new(config.max_connection_pool).with_events(events.clone()),
            ),
            store: StoreClient::new(store, &config.store),
            experiences,
            events,
            config: Arc::new(config),
        };
        (context, experience_store)
    }
}

/// Operator requests a controller handles between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    EnterMaintenance,
    ExitMaintenance,
    Recover,
}

pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<Result<IntegrationStatus, ControlError>>,
}

/// What happened to one closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    pub window_end: DateTime<Utc>,
    pub transitions: Vec<StatusTransition>,
    /// Action applied after this window, if any.
    pub action: Option<Action>,
    /// Reward recorded for the previous window's action.
    pub reward: Option<f64>,
    pub rolled_back: bool,
    /// Performance score of the window, in `[0, 1]`.
    pub performance_score: f64,
    /// Set when the window could not be committed.
    pub skipped: Option<String>,
}

impl WindowOutcome {
    fn skipped(window_end: DateTime<Utc>, performance_score: f64, reason: String) -> Self {
        Self {
            window_end,
            transitions: Vec::new(),
            action: None,
            reward: None,
            rolled_back: false,
            performance_score,
            skipped: Some(reason),
        }
    }
}

/// An action awaiting its reward.
#[derive(Debug, Clone, PartialEq)]
struct PendingAction {
    action: Action,
    state: FeatureVector,
    pre_status: IntegrationStatus,
}

struct Rollback {
    action: Option<Action>,
    restored: ConnectionParameters,
    reward: Option<f64>,
}

/// The result of deciding a window, before anything is made durable.
struct Plan {
    point: IntegrationPoint,
    transitions: Vec<StatusTransition>,
    experience: Option<Experience>,
    rollback: Option<Rollback>,
    applied: Option<(PendingAction, ConnectionParameters)>,
    pending: Option<PendingAction>,
}

pub struct PointController {
    ctx: ControllerContext,
    point: IntegrationPoint,
    pending: Option<PendingAction>,
}

impl PointController {
    /// Register the point with the aggregator and pool and take ownership of it.
    pub fn start(
        ctx: ControllerContext,
        point: IntegrationPoint,
        now: DateTime<Utc>,
    ) -> Result<Self, ControlError> {
        ctx.pool
            .register(point.point_id(), point.parameters().clone())?;
        ctx.aggregator.register(point.point_id(), now);
        info!(
            point_id = %point.point_id(),
            status = %point.status(),
            version = point.version(),
            pool_size = point.parameters().pool_size,
            "Controller attached to integration point"
        );
        Ok(Self {
            ctx,
            point,
            pending: None,
        })
    }

    pub fn point(&self) -> &IntegrationPoint {
        &self.point
    }

    pub fn point_id(&self) -> &str {
        self.point.point_id()
    }

    /// The action whose reward is still outstanding.
    pub fn pending_action(&self) -> Option<Action> {
        self.pending.as_ref().map(|p| p.action)
    }

    /// Drive the loop until shutdown or until the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControlRequest>,
        mut shutdown: watch::Receiver<bool>,
        workers: Arc<Semaphore>,
    ) {
        let mut ticker = tokio::time::interval(self.ctx.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                request = commands.recv() => match request {
                    Some(request) => {
                        let result = self.apply_command(request.command, Utc::now()).await;
                        if request.reply.send(result).is_err() {
                            debug!(point_id = %self.point_id(), "Command requester went away");
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let permit = tokio::select! {
                        _ = shutdown.changed() => break,
                        permit = workers.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let outcomes = self.run_cycle(Utc::now()).await;
                    drop(permit);
                    if !outcomes.is_empty() {
                        debug!(
                            point_id = %self.point_id(),
                            windows = outcomes.len(),
                            status = %self.point.status(),
                            "Control cycle complete"
                        );
                    }
                }
            }
        }

        self.ctx.aggregator.deregister(self.point.point_id());
        info!(point_id = %self.point_id(), "Controller stopped");
    }

    /// Process every window that has closed by `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Vec<WindowOutcome> {
        let summaries = self.ctx.aggregator.close_elapsed(self.point.point_id(), now);
        let mut outcomes = Vec::with_capacity(summaries.len());
        for summary in &summaries {
            outcomes.push(self.process_window(summary, now).await);
        }
        outcomes
    }

    /// Decide and commit one window, re-planning once on a version conflict.
    pub async fn process_window(
        &mut self,
        summary: &WindowSummary,
        now: DateTime<Utc>,
    ) -> WindowOutcome {
        let mut retried = false;
        loop {
            let plan = match self.plan(summary, now) {
                Ok(plan) => plan,
                Err(e) => return self.skip(summary, now, e.to_string()),
            };

            let base_version = self.point.version();
            let version = match self.persist(&plan).await {
                Ok(version) => version,
                Err(e) if e.is_conflict() && !retried => {
                    retried = true;
                    debug!(point_id = %self.point_id(), error = %e, "Re-reading record after conflict");
                    if let Err(e) = self.reload().await {
                        return self.skip(summary, now, e.to_string());
                    }
                    if !is_own_write(&self.point, &plan.point, base_version) {
                        continue;
                    }
                    debug!(point_id = %self.point_id(), "Conflicting record is our own write; window committed");
                    self.point.version()
                }
                Err(e) => return self.skip(summary, now, e.to_string()),
            };

            let mut outcome = self.commit(plan, version).await;
            outcome.window_end = summary.window_end;
            outcome.performance_score = self.ctx.optimizer.performance_score(summary);
            if summary.has_data() && self.ctx.optimizer.below_threshold(summary) {
                info!(
                    point_id = %self.point_id(),
                    status = %self.point.status(),
                    score = outcome.performance_score,
                    threshold = self.ctx.optimizer.settings().performance_threshold,
                    "Window scored below performance threshold"
                );
            }
            return outcome;
        }
    }

    fn plan(&self, summary: &WindowSummary, now: DateTime<Utc>) -> Result<Plan, TransitionError> {
        let optimizer = &self.ctx.optimizer;
        let mut point = self.point.clone();
        let mut transitions = Vec::new();
        let before = point.status();

        if let Some(t) = self.ctx.health.evaluate(&mut point, summary, now)? {
            transitions.push(t);
        }
        let after = point.status();
        let settled = before == IntegrationStatus::Optimizing;
        let failed = settled && after == IntegrationStatus::Failed;

        let mut reward = None;
        let mut experience = None;
        if let Some(pending) = &self.pending {
            let mut r = optimizer.reward(summary, pending.pre_status, after);
            if failed {
                r = optimizer.rollback_reward(r);
            }
            reward = Some(r);
            experience = Some(Experience {
                point_id: point.point_id().to_string(),
                state: pending.state,
                action: pending.action,
                reward: r,
                next_state: optimizer.features(summary, point.parameters()),
                terminal: after == IntegrationStatus::Failed,
                recorded_at: now,
            });
        }

        let mut rollback = None;
        if failed {
            if let Some(restored) = point.roll_back_parameters(now) {
                rollback = Some(Rollback {
                    action: self.pending.as_ref().map(|p| p.action),
                    restored,
                    reward,
                });
            }
        } else if settled {
            point.confirm_parameters();
        }

        let mut applied = None;
        let mut pending = None;
        let status = point.status();
        if status.is_optimizable() {
            let action = optimizer.select_action(status, summary, point.parameters());
            let state = optimizer.features(summary, point.parameters());
            let next = if action.is_noop() {
                None
            } else {
                optimizer.apply_action(point.parameters(), action)
            };

            let decision = PendingAction {
                action: if next.is_some() { action } else { Action::NoOp },
                state,
                pre_status: status,
            };
            if let Some(next) = next {
                let from = point.parameters().clone();
                transitions.push(self.ctx.health.begin_optimizing(&mut point, now)?);
                point.stage_parameters(next, now);
                applied = Some((decision.clone(), from));
            }
            pending = Some(decision);
        }

        Ok(Plan {
            point,
            transitions,
            experience,
            rollback,
            applied,
            pending,
        })
    }

    /// Write the planned record, returning the version it is stored under.
    async fn persist(&self, plan: &Plan) -> Result<u64, StoreError> {
        if plan.point == self.point {
            return Ok(self.point.version());
        }
        self.ctx
            .store
            .put(self.point.point_id(), &plan.point, self.point.version())
            .await
    }

    /// Carry out the side effects of a plan whose record is stored at `version`.
    async fn commit(&mut self, plan: Plan, version: u64) -> WindowOutcome {
        let Plan {
            point,
            transitions,
            experience,
            rollback,
            applied,
            pending,
        } = plan;
        let point_id = self.point.point_id().to_string();
        let point = point.with_version(version);

        if point.parameters() != self.point.parameters() {
            if let Err(e) = self
                .ctx
                .pool
                .apply_parameters(&point_id, point.parameters().clone())
            {
                error!(point_id = %point_id, error = %e, "Failed to apply persisted parameters to pool");
            }
        }

        let events = &self.ctx.events;
        for transition in &transitions {
            info!(
                point_id = %point_id,
                from = %transition.from,
                to = %transition.to,
                reason = ?transition.reason,
                "Status transition"
            );
            events.emit(ObservabilityEvent::StatusTransition(transition.clone()));
        }

        if let Some(rollback) = &rollback {
            warn!(
                point_id = %point_id,
                pool_size = rollback.restored.pool_size,
                "Point failed after an action; parameters rolled back"
            );
            events.emit(ObservabilityEvent::ActionRolledBack {
                point_id: point_id.clone(),
                action: rollback.action,
                restored: rollback.restored.clone(),
                reward: rollback.reward,
                at: Utc::now(),
            });
        }

        let reward = experience.as_ref().map(|e| e.reward);
        if let Some(experience) = experience {
            events.emit(ObservabilityEvent::ExperienceRecorded {
                point_id: point_id.clone(),
                action: experience.action,
                reward: experience.reward,
                terminal: experience.terminal,
                at: experience.recorded_at,
            });
            self.ctx.experiences.record(experience).await;
        }

        let action = applied.as_ref().map(|(p, _)| p.action);
        if let Some((decision, from)) = applied {
            info!(
                point_id = %point_id,
                action = %decision.action,
                pool_size = point.parameters().pool_size,
                timeout_ms = point.parameters().timeout.as_millis() as u64,
                retry_backoff_ms = point.parameters().retry_backoff.as_millis() as u64,
                "Applied optimizer action"
            );
            events.emit(ObservabilityEvent::ActionApplied {
                point_id: point_id.clone(),
                action: decision.action,
                from,
                to: point.parameters().clone(),
                policy_version: self.ctx.optimizer.policy().version(),
                at: Utc::now(),
            });
        }

        self.point = point;
        self.pending = pending;

        WindowOutcome {
            window_end: Utc::now(),
            transitions,
            action,
            reward,
            rolled_back: rollback.is_some(),
            performance_score: 0.0,
            skipped: None,
        }
    }

    /// Adopt the stored record after someone else wrote it.
    async fn reload(&mut self) -> Result<(), StoreError> {
        let (record, _) = self.ctx.store.get(self.point.point_id()).await?;
        if record.status() != self.point.status() {
            self.pending = None;
        }
        if record.parameters() != self.point.parameters() {
            if let Err(e) = self
                .ctx
                .pool
                .apply_parameters(record.point_id(), record.parameters().clone())
            {
                error!(point_id = %record.point_id(), error = %e, "Stored parameters rejected by pool");
            }
        }
        self.point = record;
        Ok(())
    }

    fn skip(&self, summary: &WindowSummary, now: DateTime<Utc>, reason: String) -> WindowOutcome {
        warn!(
            point_id = %self.point_id(),
            window_end = %summary.window_end,
            reason = %reason,
            "Skipping control cycle"
        );
        self.ctx.events.emit(ObservabilityEvent::CycleSkipped {
            point_id: self.point.point_id().to_string(),
            reason: reason.clone(),
            at: now,
        });
        WindowOutcome::skipped(
            summary.window_end,
            self.ctx.optimizer.performance_score(summary),
            reason,
        )
    }

    /// Apply an operator command and persist the result.
    pub async fn apply_command(
        &mut self,
        command: ControlCommand,
        now: DateTime<Utc>,
    ) -> Result<IntegrationStatus, ControlError> {
        let mut retried = false;
        loop {
            let mut point = self.point.clone();
            let health = &self.ctx.health;
            let transition = match command {
                ControlCommand::EnterMaintenance => health.enter_maintenance(&mut point, now)?,
                ControlCommand::ExitMaintenance => health.exit_maintenance(&mut point, now)?,
                ControlCommand::Recover => health.recover(&mut point, now)?,
            };

            let base_version = self.point.version();
            let stored = match self
                .ctx
                .store
                .put(point.point_id(), &point, base_version)
                .await
            {
                Ok(version) => point.with_version(version),
                Err(e) if e.is_conflict() && !retried => {
                    retried = true;
                    self.reload().await?;
                    if !is_own_write(&self.point, &point, base_version) {
                        continue;
                    }
                    self.point.clone()
                }
                Err(e) => return Err(e.into()),
            };

            if stored.parameters() != self.point.parameters() {
                if let Err(e) = self
                    .ctx
                    .pool
                    .apply_parameters(stored.point_id(), stored.parameters().clone())
                {
                    error!(point_id = %stored.point_id(), error = %e, "Failed to apply persisted parameters to pool");
                }
            }
            self.point = stored;
            self.pending = None;
            info!(
                point_id = %self.point_id(),
                command = ?command,
                from = %transition.from,
                to = %transition.to,
                "Control command applied"
            );
            self.ctx
                .events
                .emit(ObservabilityEvent::StatusTransition(transition));
            return Ok(self.point.status());
        }
    }
}

/// Whether `stored` is `intended` written as the next version after
/// `base_version`, i.e. an earlier put landed but its reply was lost.
fn is_own_write(stored: &IntegrationPoint, intended: &IntegrationPoint, base_version: u64) -> bool {
    stored.version() == base_version + 1 && stored.clone().with_version(base_version) == *intended
}

/// Cloneable handle for sending commands to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    point_id: PointId,
    commands: mpsc::Sender<ControlRequest>,
}

impl ControllerHandle {
    pub fn new(point_id: PointId, commands: mpsc::Sender<ControlRequest>) -> Self {
        Self { point_id, commands }
    }

    pub fn point_id(&self) -> &str {
        &self.point_id
    }

    pub async fn send(&self, command: ControlCommand) -> Result<IntegrationStatus, ControlError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ControlRequest { command, reply })
            .await
            .map_err(|_| ControlError::ControllerStopped(self.point_id.clone()))?;
        response
            .await
            .map_err(|_| ControlError::ControllerStopped(self.point_id.clone()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MetricsSample;
    use crate::events::CollectingEventSink;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn config() -> NexusConfig {
        NexusConfig {
            metrics_aggregation_window: Duration::from_secs(60),
            rl_exploration_rate: 0.0,
            rng_seed: Some(1),
            ml_model_path: std::env::temp_dir().join("aain-controller-unit-policy.json"),
            ..NexusConfig::default()
        }
    }

    async fn controller(store: Arc<MemoryStore>) -> (PointController, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::default());
        let (ctx, _) = ControllerContext::build(config(), store.clone(), events.clone());
        let point = IntegrationPoint::new("p-1", "ingest", "warehouse", ConnectionParameters::default(), t0());
        store.put("p-1", &point, 0).await.unwrap();
        let (point, _) = store.get("p-1").await.unwrap();
        (PointController::start(ctx, point, t0()).unwrap(), events)
    }

    fn feed(ctrl: &PointController, window: u32, count: u32, latency_ms: u64) {
        let start = t0() + chrono::Duration::seconds(60 * window as i64);
        for i in 0..count {
            let at = start + chrono::Duration::milliseconds((i as i64 * 59_000) / count.max(1) as i64);
            ctrl.ctx.aggregator.record(MetricsSample::new(
                "p-1",
                at,
                Duration::from_millis(latency_ms),
                true,
            ));
        }
    }

    #[tokio::test]
    async fn test_idle_before_window_closes() {
        let (mut ctrl, _) = controller(Arc::new(MemoryStore::new())).await;
        assert!(ctrl.run_cycle(t0() + chrono::Duration::seconds(30)).await.is_empty());
    }

    #[tokio::test]
    async fn test_activation_is_persisted_with_new_version() {
        let store = Arc::new(MemoryStore::new());
        let (mut ctrl, events) = controller(store.clone()).await;
        feed(&ctrl, 0, 9_000, 100);

        let outcomes = ctrl.run_cycle(t0() + chrono::Duration::seconds(60)).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(ctrl.point().status(), IntegrationStatus::Active);
        assert_eq!(outcomes[0].performance_score, 1.0);
        let (stored, version) = store.get("p-1").await.unwrap();
        assert_eq!(stored.status(), IntegrationStatus::Active);
        assert_eq!(version, 2);
        assert_eq!(events.names()[0], "status_transition");
    }

    #[tokio::test]
    async fn test_maintenance_command_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let (mut ctrl, _) = controller(store.clone()).await;

        let status = ctrl
            .apply_command(ControlCommand::EnterMaintenance, t0())
            .await
            .unwrap();
        assert_eq!(status, IntegrationStatus::Maintenance);

        let err = ctrl.apply_command(ControlCommand::Recover, t0()).await.unwrap_err();
        assert!(matches!(err, ControlError::Transition(_)));

        let status = ctrl
            .apply_command(ControlCommand::ExitMaintenance, t0())
            .await
            .unwrap();
        assert_eq!(status, IntegrationStatus::Pending);
        assert_eq!(store.get("p-1").await.unwrap().1, 3);
    }
}
