//! Integration store backed by a NATS JetStream key-value bucket.
//!
//! The logical record version lives inside the JSON record; the bucket's
//! per-key revision is only used to make each write a compare-and-set, so
//! two writers racing on the same point can never both succeed.

use crate::error::StoreError;
use crate::model::IntegrationPoint;
use crate::store::{IntegrationStore, PointFilter};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use nexus_config::StoreSettings;
use tracing::{debug, info, warn};

pub struct JetStreamStore {
    kv: kv::Store,
    bucket: String,
}

/// Current stored state of one key.
struct Current {
    record: IntegrationPoint,
    revision: u64,
}

/// Revision a write must find on the key. Zero means the key must not
/// exist yet, which makes the first write create-only.
fn write_revision(current: Option<&Current>) -> u64 {
    current.map(|c| c.revision).unwrap_or(0)
}

fn transient(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Transient {
        message: format!("{}: {}", context, e),
    }
}

fn check_key(point_id: &str) -> Result<(), StoreError> {
    let valid = !point_id.is_empty()
        && !point_id.starts_with('.')
        && !point_id.ends_with('.')
        && point_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::Serialization {
            message: format!("point id {:?} is not a valid KV key", point_id),
        })
    }
}

impl JetStreamStore {
    /// Connect and make sure the bucket exists.
    pub async fn connect(settings: &StoreSettings) -> Result<Self> {
        let url = settings
            .nats_url
            .as_deref()
            .context("store.nats_url is required for the jetstream backend")?;
        info!("Connecting to NATS at {} for integration records", url);
        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;
        let js = jetstream::new(client);
        Self::open(&js, &settings.bucket).await
    }

    /// Open the bucket on an existing JetStream context, creating it if needed.
    pub async fn open(js: &jetstream::Context, bucket: &str) -> Result<Self> {
        let kv = match js.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => {
                info!(bucket = %bucket, "KV bucket not found, creating it");
                js.create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    description: "Adaptive integration point records".to_string(),
                    history: 5,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .context("Failed to create integration KV bucket")?
            }
        };

        Ok(Self {
            kv,
            bucket: bucket.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn current(&self, point_id: &str) -> Result<Option<Current>, StoreError> {
        let entry = self
            .kv
            .entry(point_id)
            .await
            .map_err(|e| transient("KV entry lookup failed", e))?;

        match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                let record: IntegrationPoint =
                    serde_json::from_slice(&entry.value).map_err(|e| StoreError::Serialization {
                        message: format!("record {}: {}", point_id, e),
                    })?;
                Ok(Some(Current {
                    record,
                    revision: entry.revision,
                }))
            }
            _ => Ok(None),
        }
    }

    fn encode(record: &IntegrationPoint) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })
    }

    /// After a failed write, decide whether someone else won the race.
    async fn classify_write_failure(
        &self,
        point_id: &str,
        expected_version: u64,
        seen_revision: Option<u64>,
        error: String,
    ) -> StoreError {
        match self.current(point_id).await {
            Ok(Some(now)) if Some(now.revision) != seen_revision => StoreError::Conflict {
                point_id: point_id.to_string(),
                expected: expected_version,
                actual: now.record.version(),
            },
            Ok(_) => StoreError::Transient { message: error },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl IntegrationStore for JetStreamStore {
    async fn get(&self, point_id: &str) -> Result<(IntegrationPoint, u64), StoreError> {
        check_key(point_id)?;
        match self.current(point_id).await? {
            Some(current) => {
                let version = current.record.version();
                Ok((current.record, version))
            }
            None => Err(StoreError::NotFound {
                point_id: point_id.to_string(),
            }),
        }
    }

    async fn put(
        &self,
        point_id: &str,
        record: &IntegrationPoint,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        check_key(point_id)?;
        let current = self.current(point_id).await?;
        let actual = current.as_ref().map(|c| c.record.version()).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                point_id: point_id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let version = expected_version + 1;
        let body = Self::encode(&record.clone().with_version(version))?;

        let written = self
            .kv
            .update(point_id, body.into(), write_revision(current.as_ref()))
            .await
            .map_err(|e| e.to_string());

        match written {
            Ok(revision) => {
                debug!(
                    point_id = %point_id,
                    version = version,
                    revision = revision,
                    "Stored integration record"
                );
                Ok(version)
            }
            Err(error) => {
                let seen = current.as_ref().map(|c| c.revision);
                let classified = self
                    .classify_write_failure(point_id, expected_version, seen, error)
                    .await;
                warn!(point_id = %point_id, error = %classified, "KV write rejected");
                Err(classified)
            }
        }
    }

    async fn list(&self, filter: &PointFilter) -> Result<Vec<IntegrationPoint>, StoreError> {
        let keys: Vec<String> = self
            .kv
            .keys()
            .await
            .map_err(|e| transient("KV key listing failed", e))?
            .try_collect()
            .await
            .map_err(|e| transient("KV key listing failed", e))?;

        let mut points = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(current) = self.current(&key).await? {
                if filter.matches(&current.record) {
                    points.push(current.record);
                }
            }
        }
        points.sort_by(|a, b| a.point_id().cmp(b.point_id()));
        Ok(points)
    }
}
