//! Owns the controller fleet and the external control surface.
//!
//! Each managed point gets its own controller task; all of them share a
//! bounded worker semaphore so cycles queue when the fleet outgrows it.
//! Operator commands travel over the point's command channel and are handled
//! between cycles.

use crate::aggregator::MetricsSample;
use crate::controller::{ControlCommand, ControllerContext, ControllerHandle, PointController};
use crate::error::{ControlError, PoolError, StoreError};
use crate::events::EventSink;
use crate::experience::ExperienceStore;
use crate::model::{IntegrationPoint, IntegrationStatus, PointId};
use crate::pool::PoolPermit;
use crate::retrain::RetrainLane;
use crate::store::{IntegrationStore, PointFilter};
use chrono::Utc;
use nexus_config::NexusConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const COMMAND_QUEUE_DEPTH: usize = 16;

struct ManagedPoint {
    handle: ControllerHandle,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    ctx: ControllerContext,
    experience_store: Arc<ExperienceStore>,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    points: Mutex<HashMap<PointId, ManagedPoint>>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: NexusConfig,
        store: Arc<dyn IntegrationStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        let (ctx, experience_store) = ControllerContext::build(config, store, events);
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            experience_store,
            workers,
            shutdown,
            points: Mutex::new(HashMap::new()),
            background: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    pub fn experience_store(&self) -> &Arc<ExperienceStore> {
        &self.experience_store
    }

    /// A receiver that flips to `true` when the supervisor shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run periodic retraining on its own lane until shutdown.
    pub fn start_retrain_lane(&self) {
        let lane = RetrainLane::new(&self.ctx, self.experience_store.clone());
        let task = tokio::spawn(lane.run(self.shutdown.subscribe()));
        self.track(task);
    }

    /// Keep a background task so shutdown waits for it.
    pub fn track(&self, task: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Adopt every record already in the store.
    pub async fn start_from_store(&self) -> Result<usize, ControlError> {
        let records = self.ctx.store.list(&PointFilter::all()).await?;
        let mut points = self.points.lock().await;
        let mut adopted = 0;
        for record in records {
            if points.contains_key(record.point_id()) {
                continue;
            }
            let id = record.point_id().to_string();
            match self.spawn(record) {
                Ok(managed) => {
                    points.insert(id, managed);
                    adopted += 1;
                }
                Err(e) => warn!(point_id = %id, error = %e, "Could not adopt stored point"),
            }
        }
        info!(adopted = adopted, "Adopted integration points from store");
        Ok(adopted)
    }

    /// Start managing a point. A record that already exists in the store is
    /// adopted as stored; otherwise `point` is created.
    pub async fn add_point(&self, point: IntegrationPoint) -> Result<IntegrationPoint, ControlError> {
        let mut points = self.points.lock().await;
        let id = point.point_id().to_string();
        if points.contains_key(&id) {
            return Err(ControlError::AlreadyManaged(id));
        }

        let record = match self.ctx.store.put(&id, &point, 0).await {
            Ok(version) => point.with_version(version),
            Err(StoreError::Conflict { .. }) => {
                let (stored, _) = self.ctx.store.get(&id).await?;
                info!(point_id = %id, version = stored.version(), "Adopting existing record");
                stored
            }
            Err(e) => return Err(e.into()),
        };

        let managed = self.spawn(record.clone())?;
        points.insert(id, managed);
        Ok(record)
    }

    fn spawn(&self, record: IntegrationPoint) -> Result<ManagedPoint, ControlError> {
        let id = record.point_id().to_string();
        let controller = PointController::start(self.ctx.clone(), record, Utc::now())?;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(controller.run(
            rx,
            self.shutdown.subscribe(),
            self.workers.clone(),
        ));
        Ok(ManagedPoint {
            handle: ControllerHandle::new(id, tx),
            task,
        })
    }

    /// Stop managing a point. Its stored record is left in place.
    pub async fn remove_point(&self, point_id: &str) -> Result<(), ControlError> {
        let managed = self
            .points
            .lock()
            .await
            .remove(point_id)
            .ok_or_else(|| ControlError::UnknownPoint(point_id.to_string()))?;

        // closing the command channel stops the controller after its current step
        let ManagedPoint { handle, task } = managed;
        drop(handle);
        if let Err(e) = task.await {
            warn!(point_id = %point_id, error = %e, "Controller task ended abnormally");
        }
        self.ctx.pool.deregister(point_id);
        info!(point_id = %point_id, "Stopped managing integration point");
        Ok(())
    }

    async fn handle(&self, point_id: &str) -> Result<ControllerHandle, ControlError> {
        self.points
            .lock()
            .await
            .get(point_id)
            .map(|m| m.handle.clone())
            .ok_or_else(|| ControlError::UnknownPoint(point_id.to_string()))
    }

    pub async fn send(
        &self,
        point_id: &str,
        command: ControlCommand,
    ) -> Result<IntegrationStatus, ControlError> {
        self.handle(point_id).await?.send(command).await
    }

    pub async fn enter_maintenance(&self, point_id: &str) -> Result<IntegrationStatus, ControlError> {
        self.send(point_id, ControlCommand::EnterMaintenance).await
    }

    pub async fn exit_maintenance(&self, point_id: &str) -> Result<IntegrationStatus, ControlError> {
        self.send(point_id, ControlCommand::ExitMaintenance).await
    }

    pub async fn recover(&self, point_id: &str) -> Result<IntegrationStatus, ControlError> {
        self.send(point_id, ControlCommand::Recover).await
    }

    pub async fn point_ids(&self) -> Vec<PointId> {
        let mut ids: Vec<PointId> = self.points.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The stored record for a point.
    pub async fn point(&self, point_id: &str) -> Result<IntegrationPoint, ControlError> {
        let (record, _) = self.ctx.store.get(point_id).await?;
        Ok(record)
    }

    pub fn record_sample(&self, sample: MetricsSample) -> bool {
        self.ctx.aggregator.record(sample)
    }

    /// Wait for a connection slot on a point.
    pub async fn acquire(&self, point_id: &str) -> Result<PoolPermit, PoolError> {
        self.ctx.pool.acquire(point_id).await
    }

    /// Stop every controller and background lane, then flush pending experiences.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let drained: Vec<(PointId, ManagedPoint)> = self.points.lock().await.drain().collect();
        for (point_id, managed) in drained {
            if let Err(e) = managed.task.await {
                warn!(point_id = %point_id, error = %e, "Controller task ended abnormally");
            }
        }

        let background: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in background {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.ctx.experiences.sync().await;
        info!(
            experiences = self.experience_store.len(),
            "Supervisor shut down"
        );
    }
}
