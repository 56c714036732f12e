use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::k8s::{action_labels, add_labels};
use super::policy::{wait_for_labels, LabelSource};
use super::{cancellable, params, EventMap, Trigger, TriggerOutput};
use crate::artifact::ArtifactReader;
use crate::crd::{ArgoWorkflowOperation, ArgoWorkflowTrigger as ArgoConfig, TriggerKind, TriggerPolicy};
use crate::{Error, Result};

/// Drives Argo Workflows through the `argo` CLI.
pub struct ArgoWorkflowTrigger {
    sensor: String,
    name: String,
    config: ArgoConfig,
    policy: Option<TriggerPolicy>,
    namespace: String,
    command: String,
    artifacts: ArtifactReader,
    kube: Option<Client>,
    labels: Option<Arc<dyn LabelSource>>,
}

impl ArgoWorkflowTrigger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sensor: String,
        name: String,
        config: ArgoConfig,
        policy: Option<TriggerPolicy>,
        namespace: String,
        command: String,
        artifacts: ArtifactReader,
        kube: Option<Client>,
        labels: Option<Arc<dyn LabelSource>>,
    ) -> Self {
        Self {
            sensor,
            name,
            config,
            policy,
            namespace,
            command,
            artifacts,
            kube,
            labels,
        }
    }

    fn workflows(&self, namespace: &str) -> Option<Api<DynamicObject>> {
        let gvk = GroupVersionKind::gvk("argoproj.io", "v1alpha1", "Workflow");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "workflows");
        self.kube
            .clone()
            .map(|client| Api::namespaced_with(client, namespace, &ar))
    }
}

fn operation_verb(op: ArgoWorkflowOperation) -> &'static str {
    match op {
        ArgoWorkflowOperation::Submit => "submit",
        ArgoWorkflowOperation::Resubmit => "resubmit",
        ArgoWorkflowOperation::Retry => "retry",
        ArgoWorkflowOperation::Resume => "resume",
        ArgoWorkflowOperation::Suspend => "suspend",
        ArgoWorkflowOperation::Terminate => "terminate",
        ArgoWorkflowOperation::Stop => "stop",
    }
}

/// CLI arguments for `op`. `target` is the workflow file for submit and the workflow
/// name otherwise.
pub fn command_args(namespace: &str, op: ArgoWorkflowOperation, target: &str, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "-n".to_string(),
        namespace.to_string(),
        operation_verb(op).to_string(),
        target.to_string(),
    ];
    args.extend(extra.iter().cloned());
    args
}

/// Removes the submitted workflow file when dropped.
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[async_trait]
impl Trigger for ArgoWorkflowTrigger {
    fn trigger_type(&self) -> TriggerKind {
        TriggerKind::ArgoWorkflow
    }

    async fn fetch_resource(&self, cancel: &CancellationToken) -> Result<Value> {
        cancellable(cancel, self.artifacts.read(&self.config.source)).await
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
        let mut workflow = resource;
        let op = self.config.operation;
        let meta = |field: &str| {
            workflow
                .get("metadata")
                .and_then(|m| m.get(field))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let name = meta("name");
        let generate_name = meta("generateName");
        let namespace = match meta("namespace") {
            ns if ns.is_empty() => self.namespace.clone(),
            ns => ns,
        };

        if name.is_empty() {
            if op != ArgoWorkflowOperation::Submit {
                return Err(Error::Execution(format!(
                    "workflow {} operation needs a workflow name",
                    operation_verb(op)
                )));
            }
            if generate_name.is_empty() {
                return Err(Error::Execution(
                    "workflow has neither name nor generateName".to_string(),
                ));
            }
        }

        let labels = action_labels(&self.sensor, &self.name);
        let mut _file = None;
        let target = if op == ArgoWorkflowOperation::Submit {
            add_labels(&mut workflow, &labels)?;
            let path = std::env::temp_dir().join(format!(
                "{}{}-{}.json",
                name,
                generate_name,
                uuid::Uuid::new_v4()
            ));
            tokio::fs::write(&path, serde_json::to_vec(&workflow)?).await?;
            let target = path.to_string_lossy().into_owned();
            _file = Some(TempFile(path));
            target
        } else {
            name.clone()
        };

        let args = command_args(&namespace, op, &target, &self.config.args);
        info!(trigger = %self.name, command = %self.command, args = ?args, "running workflow command");
        let output = cancellable(cancel, async {
            Ok(Command::new(&self.command)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?)
        })
        .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(Error::Execution(format!(
                "{} command for workflow {} failed: {}",
                operation_verb(op),
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(trigger = %self.name, stdout = %stdout, "workflow command finished");

        let Some(api) = self.workflows(&namespace) else {
            return Ok(TriggerOutput::Command {
                exit_code: output.status.code().unwrap_or_default(),
                stdout,
            });
        };

        if op != ArgoWorkflowOperation::Submit {
            let object = cancellable(cancel, async { Ok(api.get(&name).await?) }).await?;
            return Ok(TriggerOutput::Resource(serde_json::to_value(object)?));
        }

        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let list = cancellable(cancel, async {
            Ok(api.list(&ListParams::default().labels(&selector)).await?)
        })
        .await?;
        let submitted = list.items.into_iter().next().ok_or_else(|| {
            Error::Execution("submitted workflow not found by its action labels".to_string())
        })?;
        Ok(TriggerOutput::Resource(serde_json::to_value(submitted)?))
    }

    async fn apply_policy(&self, cancel: &CancellationToken, output: &TriggerOutput) -> Result<()> {
        let Some(policy) = self.policy.as_ref().and_then(|p| p.k8s.as_ref()) else {
            return Ok(());
        };
        if policy.labels.is_empty() {
            return Ok(());
        }
        match (output, &self.labels) {
            (TriggerOutput::Resource(resource), Some(labels)) => {
                wait_for_labels(policy, labels.as_ref(), resource, cancel).await
            }
            _ => Ok(()),
        }
    }
}
