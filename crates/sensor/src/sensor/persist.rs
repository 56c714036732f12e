//! Durable storage of a sensor's status with optimistic concurrency.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crd::{Sensor, SensorStatus};
use crate::triggers::backoff::{self, BackoffSchedule};
use crate::{Error, Result};

/// Backing store of sensor status. Updates carry the resource version they were based
/// on and fail with [`Error::Conflict`] when another writer got there first.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Current status and resource version.
    async fn get(&self, name: &str) -> Result<(SensorStatus, Option<String>)>;

    /// Replace the status, returning the new resource version.
    async fn update(
        &self,
        name: &str,
        status: &SensorStatus,
        resource_version: Option<String>,
    ) -> Result<Option<String>>;
}

pub struct KubeSensorStore {
    api: Api<Sensor>,
}

impl KubeSensorStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn map_conflict(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => {
            Error::Conflict(format!("sensor {}: {}", name, resp.message))
        }
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::NotFound(format!("sensor {}", name))
        }
        other => Error::Kubernetes(other),
    }
}

#[async_trait]
impl SensorStore for KubeSensorStore {
    async fn get(&self, name: &str) -> Result<(SensorStatus, Option<String>)> {
        let sensor = self
            .api
            .get_status(name)
            .await
            .map_err(|e| map_conflict(name, e))?;
        Ok((
            sensor.status.unwrap_or_default(),
            sensor.metadata.resource_version,
        ))
    }

    async fn update(
        &self,
        name: &str,
        status: &SensorStatus,
        resource_version: Option<String>,
    ) -> Result<Option<String>> {
        let body = serde_json::json!({
            "apiVersion": Sensor::api_version(&()),
            "kind": Sensor::kind(&()),
            "metadata": {
                "name": name,
                "resourceVersion": resource_version,
            },
            "status": status,
        });
        let updated = self
            .api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&body)?)
            .await
            .map_err(|e| map_conflict(name, e))?;
        Ok(updated.metadata.resource_version)
    }
}

/// Versioned in-process store for local runs and tests.
#[derive(Default)]
pub struct InMemoryStore {
    sensors: RwLock<HashMap<String, (SensorStatus, u64)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest stored status, if any was written.
    pub async fn status(&self, name: &str) -> Option<SensorStatus> {
        self.sensors.read().await.get(name).map(|(s, _)| s.clone())
    }
}

#[async_trait]
impl SensorStore for InMemoryStore {
    async fn get(&self, name: &str) -> Result<(SensorStatus, Option<String>)> {
        let sensors = self.sensors.read().await;
        Ok(match sensors.get(name) {
            Some((status, version)) => (status.clone(), Some(version.to_string())),
            None => (SensorStatus::default(), Some("0".to_string())),
        })
    }

    async fn update(
        &self,
        name: &str,
        status: &SensorStatus,
        resource_version: Option<String>,
    ) -> Result<Option<String>> {
        let mut sensors = self.sensors.write().await;
        let current = sensors.get(name).map(|(_, v)| *v).unwrap_or(0);
        if let Some(expected) = resource_version {
            if expected != current.to_string() {
                return Err(Error::Conflict(format!(
                    "sensor {}: resource version {} is stale, current is {}",
                    name, expected, current
                )));
            }
        }
        let next = current + 1;
        sensors.insert(name.to_string(), (status.clone(), next));
        Ok(Some(next.to_string()))
    }
}

/// Write `status` to the store, re-fetching the latest resource version and retrying
/// transient failures on `schedule`. The in-memory status always wins over what is stored.
pub async fn persist_status(
    store: &dyn SensorStore,
    name: &str,
    status: &SensorStatus,
    schedule: &BackoffSchedule,
    cancel: &CancellationToken,
) -> Result<()> {
    backoff::retry(
        schedule,
        cancel,
        |e| {
            let transient = e.is_transient();
            if transient {
                warn!(sensor = %name, error = %e, "status update failed, retrying");
            }
            transient
        },
        || async {
            let (_, resource_version) = store.get(name).await?;
            store.update(name, status, resource_version).await?;
            Ok(())
        },
    )
    .await?;
    debug!(sensor = %name, "status persisted");
    Ok(())
}
