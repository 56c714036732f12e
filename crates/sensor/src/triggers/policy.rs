//! Post-execution success criteria.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::core::GroupVersionKind;
use kube::{discovery, Client};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backoff::{poll_until, BackoffSchedule};
use crate::crd::{K8sResourcePolicy, StatusPolicy};
use crate::{Error, Result};

/// The response status must be one of the allowed codes.
pub fn check_status(policy: &StatusPolicy, status: u16) -> Result<()> {
    if policy.allow.contains(&status) {
        Ok(())
    } else {
        Err(Error::Policy(format!(
            "response status {} is not in the allowed list {:?}",
            status, policy.allow
        )))
    }
}

/// Current labels of a resource produced by a trigger.
#[async_trait]
pub trait LabelSource: Send + Sync {
    async fn labels(&self, resource: &Value) -> Result<BTreeMap<String, String>>;
}

/// Reads labels of the live object from the API server.
pub struct KubeLabelSource {
    client: Client,
    default_namespace: String,
}

impl KubeLabelSource {
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }
}

fn object_coordinates(resource: &Value) -> Result<(GroupVersionKind, String, Option<String>)> {
    let field = |path: &str| crate::jsonpath::get(resource, path).and_then(Value::as_str);
    let api_version = field("apiVersion")
        .ok_or_else(|| Error::Policy("resource has no apiVersion".to_string()))?;
    let kind = field("kind").ok_or_else(|| Error::Policy("resource has no kind".to_string()))?;
    let name = field("metadata.name")
        .ok_or_else(|| Error::Policy("resource has no metadata.name".to_string()))?;
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    Ok((
        GroupVersionKind::gvk(group, version, kind),
        name.to_string(),
        field("metadata.namespace").map(str::to_string),
    ))
}

#[async_trait]
impl LabelSource for KubeLabelSource {
    async fn labels(&self, resource: &Value) -> Result<BTreeMap<String, String>> {
        let (gvk, name, namespace) = object_coordinates(resource)?;
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await?;
        let api: Api<DynamicObject> = if matches!(caps.scope, discovery::Scope::Namespaced) {
            let ns = namespace.unwrap_or_else(|| self.default_namespace.clone());
            Api::namespaced_with(self.client.clone(), &ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        let object = api.get(&name).await?;
        Ok(object.metadata.labels.unwrap_or_default())
    }
}

/// Poll the resource until it carries every expected label. Running out of steps is
/// only an error when `errorOnBackoffTimeout` is set.
pub async fn wait_for_labels(
    policy: &K8sResourcePolicy,
    source: &dyn LabelSource,
    resource: &Value,
    cancel: &CancellationToken,
) -> Result<()> {
    let schedule = BackoffSchedule::from_spec(&policy.backoff)?;
    let result = poll_until(&schedule, cancel, || async {
        let labels = source.labels(resource).await?;
        Ok(policy
            .labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v)))
    })
    .await;

    match result {
        Ok(()) => {
            info!("resource labels satisfied the trigger policy");
            Ok(())
        }
        Err(Error::BackoffTimeout) if !policy.error_on_backoff_timeout => {
            warn!("timed out waiting for resource labels, treating trigger as successful");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
