use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::policy::{wait_for_labels, LabelSource};
use super::{cancellable, params, EventMap, Trigger, TriggerOutput};
use crate::artifact::ArtifactReader;
use crate::crd::{K8sOperation, K8sTrigger as K8sConfig, TriggerKind, TriggerPolicy};
use crate::{Error, Result};

pub const SENSOR_LABEL: &str = "tripwire.io/sensor";
pub const TRIGGER_LABEL: &str = "tripwire.io/trigger";
pub const ACTION_TIMESTAMP_LABEL: &str = "tripwire.io/action-timestamp";

/// Plural names of resources that live outside any namespace.
const CLUSTER_RESOURCES: &[&str] = &[
    "namespaces",
    "nodes",
    "persistentvolumes",
    "clusterroles",
    "clusterrolebindings",
    "customresourcedefinitions",
    "storageclasses",
    "priorityclasses",
];

/// Labels stamped on every object a trigger creates.
pub fn action_labels(sensor: &str, trigger: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SENSOR_LABEL.to_string(), sensor.to_string()),
        (TRIGGER_LABEL.to_string(), trigger.to_string()),
        (
            ACTION_TIMESTAMP_LABEL.to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ),
    ])
}

/// Merge `labels` into `metadata.labels` of a JSON object.
pub(crate) fn add_labels(object: &mut Value, labels: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in labels {
        let path = format!("metadata.labels.{}", key.replace('.', "\\."));
        crate::jsonpath::set(object, &path, Value::String(value.clone()))?;
    }
    Ok(())
}

/// Deep merge `patch` over `base`; scalars and arrays in `patch` win.
pub fn merge_values(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Creates, updates, patches or deletes an arbitrary Kubernetes object.
pub struct K8sTrigger {
    sensor: String,
    name: String,
    config: K8sConfig,
    policy: Option<TriggerPolicy>,
    client: Client,
    namespace: String,
    artifacts: ArtifactReader,
    labels: Option<Arc<dyn LabelSource>>,
}

impl K8sTrigger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sensor: String,
        name: String,
        config: K8sConfig,
        policy: Option<TriggerPolicy>,
        client: Client,
        namespace: String,
        artifacts: ArtifactReader,
        labels: Option<Arc<dyn LabelSource>>,
    ) -> Self {
        Self {
            sensor,
            name,
            config,
            policy,
            client,
            namespace,
            artifacts,
            labels,
        }
    }

    fn api_resource(&self, object: &Value) -> Result<ApiResource> {
        let kind = object
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Execution("resource has no kind".to_string()))?;
        let gvk = GroupVersionKind::gvk(&self.config.group, &self.config.version, kind);
        Ok(ApiResource::from_gvk_with_plural(&gvk, &self.config.resource))
    }

    fn api(&self, object: &Value, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let ar = self.api_resource(object)?;
        Ok(match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }

    /// Namespace the object is written to, `None` for cluster-scoped resources.
    fn target_namespace(&self, object: &Value) -> Option<String> {
        target_namespace(&self.config.resource, object, &self.namespace)
    }
}

fn target_namespace(resource: &str, object: &Value, default_namespace: &str) -> Option<String> {
    if CLUSTER_RESOURCES.contains(&resource) {
        return None;
    }
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .filter(|ns| !ns.is_empty())
        .unwrap_or(default_namespace);
    Some(namespace.to_string())
}

fn object_name(object: &Value) -> Result<String> {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Execution("resource has no metadata.name".to_string()))
}

fn patch_for(strategy: Option<&str>, body: Value) -> Result<Patch<Value>> {
    match strategy.unwrap_or("merge") {
        "merge" | "application/merge-patch+json" => Ok(Patch::Merge(body)),
        "strategic" | "application/strategic-merge-patch+json" => Ok(Patch::Strategic(body)),
        other => Err(Error::Execution(format!("unsupported patch strategy '{}'", other))),
    }
}

#[async_trait]
impl Trigger for K8sTrigger {
    fn trigger_type(&self) -> TriggerKind {
        TriggerKind::K8s
    }

    async fn fetch_resource(&self, cancel: &CancellationToken) -> Result<Value> {
        let object = cancellable(cancel, self.artifacts.read(&self.config.source)).await?;
        if !(self.config.live_object && self.config.operation == K8sOperation::Update) {
            return Ok(object);
        }

        let name = object_name(&object)?;
        let namespace = if CLUSTER_RESOURCES.contains(&self.config.resource.as_str()) {
            None
        } else {
            let ns = object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .filter(|ns| !ns.is_empty())
                .ok_or_else(|| {
                    Error::Execution(
                        "resource namespace must be set to fetch the live object".to_string(),
                    )
                })?;
            Some(ns.to_string())
        };
        let api = self.api(&object, namespace.as_deref())?;
        let live = cancellable(cancel, async { Ok(api.get(&name).await?) }).await?;
        Ok(serde_json::to_value(live)?)
    }

    async fn apply_resource_parameters(&self, events: &EventMap, resource: Value) -> Result<Value> {
        params::apply_params(resource, &self.config.parameters, events)
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        _events: &EventMap,
        resource: Value,
    ) -> Result<TriggerOutput> {
        let mut object = resource;
        let namespace = self.target_namespace(&object);
        if let Some(ns) = &namespace {
            crate::jsonpath::set(&mut object, "metadata.namespace", Value::String(ns.clone()))?;
        }
        let api = self.api(&object, namespace.as_deref())?;
        let pp = PostParams::default();

        let result = match self.config.operation {
            K8sOperation::Create => {
                info!(trigger = %self.name, "creating the object");
                add_labels(&mut object, &action_labels(&self.sensor, &self.name))?;
                let dynamic: DynamicObject = serde_json::from_value(object)?;
                let created = cancellable(cancel, async { Ok(api.create(&pp, &dynamic).await?) }).await?;
                serde_json::to_value(created)?
            }
            K8sOperation::Update => {
                info!(trigger = %self.name, "updating the object");
                let name = object_name(&object)?;
                let existing = cancellable(cancel, async { Ok(api.get_opt(&name).await?) }).await?;
                let dynamic: DynamicObject = match existing {
                    Some(existing) => {
                        let mut merged = serde_json::to_value(existing)?;
                        merge_values(&mut merged, object);
                        serde_json::from_value(merged)?
                    }
                    None => {
                        info!(trigger = %self.name, "object not found, creating it");
                        let dynamic: DynamicObject = serde_json::from_value(object)?;
                        let created =
                            cancellable(cancel, async { Ok(api.create(&pp, &dynamic).await?) }).await?;
                        return Ok(TriggerOutput::Resource(serde_json::to_value(created)?));
                    }
                };
                let replaced =
                    cancellable(cancel, async { Ok(api.replace(&name, &pp, &dynamic).await?) }).await?;
                serde_json::to_value(replaced)?
            }
            K8sOperation::Patch => {
                info!(trigger = %self.name, "patching the object");
                let name = object_name(&object)?;
                let existing = cancellable(cancel, async { Ok(api.get_opt(&name).await?) }).await?;
                if existing.is_none() {
                    info!(trigger = %self.name, "object not found, creating it");
                    let dynamic: DynamicObject = serde_json::from_value(object)?;
                    let created = cancellable(cancel, async { Ok(api.create(&pp, &dynamic).await?) }).await?;
                    return Ok(TriggerOutput::Resource(serde_json::to_value(created)?));
                }
                let patch = patch_for(self.config.patch_strategy.as_deref(), object)?;
                let patched = cancellable(cancel, async {
                    Ok(api.patch(&name, &PatchParams::default(), &patch).await?)
                })
                .await?;
                serde_json::to_value(patched)?
            }
            K8sOperation::Delete => {
                info!(trigger = %self.name, "deleting the object");
                let name = object_name(&object)?;
                let existing = cancellable(cancel, async { Ok(api.get_opt(&name).await?) }).await?;
                if existing.is_some() {
                    cancellable(cancel, async {
                        Ok(api.delete(&name, &DeleteParams::default()).await?)
                    })
                    .await?;
                } else {
                    info!(trigger = %self.name, "object not found, nothing to delete");
                }
                Value::Null
            }
        };
        Ok(TriggerOutput::Resource(result))
    }

    async fn apply_policy(&self, cancel: &CancellationToken, output: &TriggerOutput) -> Result<()> {
        let Some(policy) = self.policy.as_ref().and_then(|p| p.k8s.as_ref()) else {
            return Ok(());
        };
        if policy.labels.is_empty() {
            return Ok(());
        }
        let (TriggerOutput::Resource(resource), Some(labels)) = (output, &self.labels) else {
            return Ok(());
        };
        if resource.is_null() {
            return Ok(());
        }
        wait_for_labels(policy, labels.as_ref(), resource, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_values_overrides_leaves() {
        let mut base = json!({
            "metadata": {"name": "web", "labels": {"app": "web"}, "resourceVersion": "7"},
            "spec": {"replicas": 1, "template": {"image": "nginx:1.0"}}
        });
        merge_values(
            &mut base,
            json!({"metadata": {"labels": {"tier": "front"}}, "spec": {"replicas": 3}}),
        );
        assert_eq!(base["spec"]["replicas"], 3);
        assert_eq!(base["spec"]["template"]["image"], "nginx:1.0");
        assert_eq!(base["metadata"]["labels"]["app"], "web");
        assert_eq!(base["metadata"]["labels"]["tier"], "front");
        assert_eq!(base["metadata"]["resourceVersion"], "7");
    }

    #[test]
    fn test_action_labels_are_added() {
        let mut object = json!({"kind": "Pod", "metadata": {"name": "p"}});
        add_labels(&mut object, &action_labels("s", "t")).unwrap();
        assert_eq!(object["metadata"]["labels"][SENSOR_LABEL], "s");
        assert_eq!(object["metadata"]["labels"][TRIGGER_LABEL], "t");
        assert!(object["metadata"]["labels"][ACTION_TIMESTAMP_LABEL].is_string());
    }

    #[test]
    fn test_target_namespace() {
        let namespaced = json!({"metadata": {"name": "p", "namespace": "ops"}});
        let bare = json!({"metadata": {"name": "p"}});
        assert_eq!(target_namespace("pods", &namespaced, "default").as_deref(), Some("ops"));
        assert_eq!(target_namespace("pods", &bare, "default").as_deref(), Some("default"));
        assert_eq!(target_namespace("namespaces", &namespaced, "default"), None);
    }

    #[test]
    fn test_patch_strategy() {
        assert!(matches!(patch_for(None, json!({})), Ok(Patch::Merge(_))));
        assert!(matches!(patch_for(Some("strategic"), json!({})), Ok(Patch::Strategic(_))));
        assert!(patch_for(Some("bogus"), json!({})).is_err());
    }

    #[test]
    fn test_object_name_required() {
        assert!(object_name(&json!({"metadata": {}})).is_err());
        assert_eq!(object_name(&json!({"metadata": {"name": "x"}})).unwrap(), "x");
    }
}
