//! Per-point bounded connection pools.
//!
//! A pool is a counter guarded by a mutex plus a [`Notify`] for waiters.
//! Acquiring past the current `pool_size` waits for at most the point's
//! `timeout` parameter and then fails with [`PoolError::Saturated`].
//! Shrinking a pool never revokes connections already handed out; it only
//! holds back new admissions until enough permits are returned.

use crate::error::PoolError;
use crate::events::{EventSink, ObservabilityEvent};
use crate::model::{ConnectionParameters, PointId};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub point_id: PointId,
    pub pool_size: u32,
    pub in_use: u32,
    pub waiting: u32,
    pub acquired_total: u64,
    pub saturated_total: u64,
}

#[derive(Debug)]
struct PoolState {
    params: ConnectionParameters,
    in_use: u32,
    waiting: u32,
    acquired_total: u64,
    saturated_total: u64,
}

#[derive(Debug)]
struct PointPool {
    point_id: PointId,
    state: Mutex<PoolState>,
    released: Notify,
}

impl PointPool {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_admit(&self) -> bool {
        let mut state = self.lock();
        if state.in_use < state.params.pool_size {
            state.in_use += 1;
            state.acquired_total += 1;
            true
        } else {
            false
        }
    }

    fn give_back(&self) {
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// Decrements the waiting gauge even if the acquiring future is dropped.
struct WaitGuard<'a>(&'a PointPool);

impl<'a> WaitGuard<'a> {
    fn new(pool: &'a PointPool) -> Self {
        pool.lock().waiting += 1;
        Self(pool)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

/// A held connection slot. Dropping it returns the slot to its pool.
#[derive(Debug)]
#[must_use = "dropping a permit releases the connection slot immediately"]
pub struct PoolPermit {
    pool: Arc<PointPool>,
}

impl PoolPermit {
    pub fn point_id(&self) -> &str {
        &self.pool.point_id
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.pool.give_back();
    }
}

/// Owns one pool per integration point and applies parameter changes.
pub struct ConnectionPoolManager {
    max_pool: u32,
    pools: RwLock<HashMap<PointId, Arc<PointPool>>>,
    events: Option<Arc<dyn EventSink>>,
}

impl ConnectionPoolManager {
    pub fn new(max_pool: u32) -> Self {
        Self {
            max_pool,
            pools: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    /// Report saturation as backpressure events.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_pool(&self) -> u32 {
        self.max_pool
    }

    fn check_size(&self, point_id: &str, requested: u32) -> Result<(), PoolError> {
        if requested == 0 || requested > self.max_pool {
            return Err(PoolError::ExceedsMaximum {
                point_id: point_id.to_string(),
                requested,
                maximum: self.max_pool,
            });
        }
        Ok(())
    }

    fn pool(&self, point_id: &str) -> Result<Arc<PointPool>, PoolError> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools
            .get(point_id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPoint(point_id.to_string()))
    }

    /// Create the pool for a point, or update its parameters if it exists.
    pub fn register(&self, point_id: &str, params: ConnectionParameters) -> Result<(), PoolError> {
        self.check_size(point_id, params.pool_size)?;
        if self.pool(point_id).is_ok() {
            return self.apply_parameters(point_id, params).map(|_| ());
        }

        let pool = Arc::new(PointPool {
            point_id: point_id.to_string(),
            state: Mutex::new(PoolState {
                params,
                in_use: 0,
                waiting: 0,
                acquired_total: 0,
                saturated_total: 0,
            }),
            released: Notify::new(),
        });
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools.entry(point_id.to_string()).or_insert(pool);
        Ok(())
    }

    /// Stop admitting on a point. Outstanding permits stay valid.
    pub fn deregister(&self, point_id: &str) -> bool {
        let removed = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            pools.remove(point_id)
        };
        match removed {
            Some(pool) => {
                // wake waiters so they observe the pool is gone and time out
                pool.released.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Wait up to the point's `timeout` parameter for a free slot.
    pub async fn acquire(&self, point_id: &str) -> Result<PoolPermit, PoolError> {
        let pool = self.pool(point_id)?;
        let wait = pool.lock().params.timeout;
        let deadline = tokio::time::Instant::now() + wait;
        let _waiting = WaitGuard::new(&pool);

        loop {
            let released = pool.released.notified();
            tokio::pin!(released);
            // register interest before checking so a release in between is not lost
            released.as_mut().enable();

            if pool.try_admit() {
                return Ok(PoolPermit { pool: pool.clone() });
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                pool.lock().saturated_total += 1;
                debug!(point_id = %point_id, waited_ms = wait.as_millis() as u64, "Pool saturated");
                if let Some(events) = &self.events {
                    events.emit(ObservabilityEvent::Backpressure {
                        point_id: point_id.to_string(),
                        waited_ms: wait.as_millis() as u64,
                        at: Utc::now(),
                    });
                }
                return Err(PoolError::Saturated {
                    point_id: point_id.to_string(),
                    waited: wait,
                });
            }
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, point_id: &str) -> Result<PoolPermit, PoolError> {
        let pool = self.pool(point_id)?;
        if pool.try_admit() {
            return Ok(PoolPermit { pool });
        }
        pool.lock().saturated_total += 1;
        Err(PoolError::Saturated {
            point_id: point_id.to_string(),
            waited: std::time::Duration::ZERO,
        })
    }

    /// Return a slot explicitly; equivalent to dropping the permit.
    pub fn release(&self, permit: PoolPermit) {
        drop(permit);
    }

    /// Swap in new parameters, returning the previous set.
    pub fn apply_parameters(
        &self,
        point_id: &str,
        params: ConnectionParameters,
    ) -> Result<ConnectionParameters, PoolError> {
        self.check_size(point_id, params.pool_size)?;
        let pool = self.pool(point_id)?;

        let (previous, in_use) = {
            let mut state = pool.lock();
            let previous = std::mem::replace(&mut state.params, params.clone());
            (previous, state.in_use)
        };

        if params.pool_size < in_use {
            warn!(
                point_id = %point_id,
                pool_size = params.pool_size,
                in_use = in_use,
                "Pool shrunk below connections in use; draining"
            );
        }
        if params.pool_size > previous.pool_size {
            pool.released.notify_waiters();
        }
        debug!(
            point_id = %point_id,
            from = previous.pool_size,
            to = params.pool_size,
            "Applied connection parameters"
        );
        Ok(previous)
    }

    pub fn parameters(&self, point_id: &str) -> Option<ConnectionParameters> {
        self.pool(point_id).ok().map(|p| p.lock().params.clone())
    }

    pub fn stats(&self, point_id: &str) -> Option<PoolStats> {
        let pool = self.pool(point_id).ok()?;
        let state = pool.lock();
        Some(PoolStats {
            point_id: point_id.to_string(),
            pool_size: state.params.pool_size,
            in_use: state.in_use,
            waiting: state.waiting,
            acquired_total: state.acquired_total,
            saturated_total: state.saturated_total,
        })
    }
}
