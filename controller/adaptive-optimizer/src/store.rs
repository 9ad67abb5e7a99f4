//! Persistence seam for integration point records.
//!
//! Writes are optimistic: every `put` names the version it expects to
//! replace, and a mismatch is a [`StoreError::Conflict`]. Records are
//! created with an expected version of 0 and each accepted write bumps the
//! version by one.

use crate::error::StoreError;
use crate::model::{IntegrationPoint, IntegrationStatus, ModuleType, PointId};
use async_trait::async_trait;
use nexus_config::StoreSettings;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// Selects records by status and module types; empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointFilter {
    pub status: Option<IntegrationStatus>,
    pub source_type: Option<ModuleType>,
    pub target_type: Option<ModuleType>,
}

impl PointFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: IntegrationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, point: &IntegrationPoint) -> bool {
        self.status.map_or(true, |s| point.status() == s)
            && self.source_type.map_or(true, |t| point.source_type() == t)
            && self.target_type.map_or(true, |t| point.target_type() == t)
    }
}

/// Durable store of integration point records.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    /// Fetch a record and its current version.
    async fn get(&self, point_id: &str) -> Result<(IntegrationPoint, u64), StoreError>;

    /// Replace the record at `expected_version`, returning the new version.
    async fn put(
        &self,
        point_id: &str,
        record: &IntegrationPoint,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    async fn list(&self, filter: &PointFilter) -> Result<Vec<IntegrationPoint>, StoreError>;
}

/// In-process store; the default backend and the one tests run against.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<PointId, IntegrationPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn get(&self, point_id: &str) -> Result<(IntegrationPoint, u64), StoreError> {
        let records = self.records.read().await;
        records
            .get(point_id)
            .map(|p| (p.clone(), p.version()))
            .ok_or_else(|| StoreError::NotFound {
                point_id: point_id.to_string(),
            })
    }

    async fn put(
        &self,
        point_id: &str,
        record: &IntegrationPoint,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let actual = records.get(point_id).map(|p| p.version()).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                point_id: point_id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let version = expected_version + 1;
        records.insert(point_id.to_string(), record.clone().with_version(version));
        Ok(version)
    }

    async fn list(&self, filter: &PointFilter) -> Result<Vec<IntegrationPoint>, StoreError> {
        let records = self.records.read().await;
        let mut points: Vec<IntegrationPoint> =
            records.values().filter(|p| filter.matches(p)).cloned().collect();
        points.sort_by(|a, b| a.point_id().cmp(b.point_id()));
        Ok(points)
    }
}

/// Wraps a store with per-call timeouts and retry of transient failures.
///
/// Retrying a `put` is safe: if the first attempt landed but its reply was
/// lost, the retry sees a version conflict instead of writing twice.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn IntegrationStore>,
    operation_timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn IntegrationStore>, settings: &StoreSettings) -> Self {
        Self {
            store,
            operation_timeout: settings.operation_timeout,
            max_attempts: settings.max_attempts.max(1),
            retry_backoff: settings.retry_backoff,
        }
    }

    pub fn inner(&self) -> &Arc<dyn IntegrationStore> {
        &self.store
    }

    pub async fn get(&self, point_id: &str) -> Result<(IntegrationPoint, u64), StoreError> {
        self.call("get", point_id, move || self.store.get(point_id)).await
    }

    pub async fn put(
        &self,
        point_id: &str,
        record: &IntegrationPoint,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.call("put", point_id, move || {
            self.store.put(point_id, record, expected_version)
        })
        .await
    }

    pub async fn list(&self, filter: &PointFilter) -> Result<Vec<IntegrationPoint>, StoreError> {
        self.call("list", "*", move || self.store.list(filter)).await
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        point_id: &str,
        mut attempt_fn: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = self
                    .retry_backoff
                    .saturating_mul(2_u32.saturating_pow(attempt - 1));
                warn!(
                    operation = operation,
                    point_id = %point_id,
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying store operation after backoff"
                );
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(self.operation_timeout, attempt_fn()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() => last_error = Some(e),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    last_error = Some(StoreError::Timeout {
                        operation,
                        after: self.operation_timeout,
                    })
                }
            }
        }

        Err(last_error.unwrap_or(StoreError::Transient {
            message: format!("{} failed without attempts", operation),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionParameters;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn point(id: &str) -> IntegrationPoint {
        IntegrationPoint::new(id, "a", "b", ConnectionParameters::default(), Utc::now())
    }

    #[tokio::test]
    async fn test_create_then_update_bumps_version() {
        let store = MemoryStore::new();
        assert_eq!(store.put("p-1", &point("p-1"), 0).await.unwrap(), 1);
        assert_eq!(store.put("p-1", &point("p-1"), 1).await.unwrap(), 2);

        let (record, version) = store.get("p-1").await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(record.version(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let store = MemoryStore::new();
        store.put("p-1", &point("p-1"), 0).await.unwrap();
        let err = store.put("p-1", &point("p-1"), 0).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                point_id: "p-1".into(),
                expected: 0,
                actual: 1
            }
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = MemoryStore::new();
        store.put("p-2", &point("p-2"), 0).await.unwrap();
        store.put("p-1", &point("p-1"), 0).await.unwrap();

        let pending = store
            .list(&PointFilter::with_status(IntegrationStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].point_id(), "p-1");

        let active = store
            .list(&PointFilter::with_status(IntegrationStatus::Active))
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl IntegrationStore for FlakyStore {
        async fn get(&self, point_id: &str) -> Result<(IntegrationPoint, u64), StoreError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Transient {
                    message: "connection reset".into(),
                });
            }
            self.inner.get(point_id).await
        }

        async fn put(
            &self,
            point_id: &str,
            record: &IntegrationPoint,
            expected_version: u64,
        ) -> Result<u64, StoreError> {
            self.inner.put(point_id, record, expected_version).await
        }

        async fn list(&self, filter: &PointFilter) -> Result<Vec<IntegrationPoint>, StoreError> {
            self.inner.list(filter).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_retries_transient_failures() {
        let inner = MemoryStore::new();
        inner.put("p-1", &point("p-1"), 0).await.unwrap();
        let flaky = Arc::new(FlakyStore {
            inner,
            failures_left: AtomicU32::new(2),
        });
        let client = StoreClient::new(flaky.clone(), &StoreSettings::default());

        let (_, version) = client.get("p-1").await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(flaky.failures_left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_gives_up_after_max_attempts() {
        let flaky = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(10),
        });
        let client = StoreClient::new(flaky, &StoreSettings::default());

        let err = client.get("p-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_does_not_retry_conflicts() {
        let store = Arc::new(MemoryStore::new());
        store.put("p-1", &point("p-1"), 0).await.unwrap();
        let client = StoreClient::new(store, &StoreSettings::default());

        let err = client.put("p-1", &point("p-1"), 0).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
