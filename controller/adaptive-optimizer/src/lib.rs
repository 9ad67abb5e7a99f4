//! Adaptive Integration Nexus optimizer engine.
//!
//! Manages a fleet of integration points between ecosystem modules. For each
//! point a controller aggregates metrics into windows, moves the point through
//! its health state machine, and lets a learned policy tune its connection
//! parameters. Records are persisted with optimistic concurrency and every
//! decision is reported to an observability sink.

pub mod aggregator;
pub mod controller;
pub mod error;
pub mod events;
pub mod experience;
pub mod health;
pub mod ingest;
pub mod kv_store;
pub mod model;
pub mod optimizer;
pub mod policy;
pub mod pool;
pub mod retrain;
pub mod store;
pub mod supervisor;

pub use aggregator::{MetricsAggregator, MetricsSample, WindowSummary};
pub use controller::{ControlCommand, ControllerContext, PointController, WindowOutcome};
pub use error::{ControlError, PoolError, StoreError, TrainingError, TransitionError};
pub use events::{
    CollectingEventSink, EventSink, JetStreamEventSink, ObservabilityEvent, TracingEventSink,
};
pub use experience::{Experience, ExperienceStore};
pub use health::{HealthMonitor, HealthThresholds};
pub use ingest::SampleConsumer;
pub use kv_store::JetStreamStore;
pub use model::{ConnectionParameters, IntegrationPoint, IntegrationStatus, ModuleType, PointId};
pub use optimizer::{Action, Optimizer};
pub use policy::Policy;
pub use pool::ConnectionPoolManager;
pub use store::{IntegrationStore, MemoryStore, PointFilter, StoreClient};
pub use supervisor::Supervisor;
