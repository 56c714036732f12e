//! Trigger execution: the capability every backend implements, parameter substitution,
//! policies, the backend registry and the four-step pipeline.

pub mod argo_workflow;
pub mod backoff;
pub mod http;
pub mod k8s;
pub mod log;
pub mod nats;
pub mod openwhisk;
pub mod params;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod slack;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::crd::{Event, TriggerKind, TriggerPolicy};
use crate::{Error, Result};

pub use pipeline::run_trigger;
pub use registry::{ClientCache, TriggerEnv, TriggerRegistry};

/// Resolved events keyed by dependency name.
pub type EventMap = HashMap<String, Event>;

/// What a backend reports back from `execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutput {
    /// HTTP-style response
    Http { status: u16, body: String },
    /// Object created, updated, patched or deleted in the cluster
    Resource(Value),
    /// Finished subprocess
    Command { exit_code: i32, stdout: String },
    /// Fire-and-forget delivery accepted
    Ack,
}

#[async_trait]
pub trait Trigger: Send + Sync {
    fn trigger_type(&self) -> TriggerKind;

    /// Build the backend-specific resource the parameters are applied to.
    async fn fetch_resource(&self, cancel: &CancellationToken) -> Result<Value>;

    async fn apply_resource_parameters(&self, events: &EventMap, resource: Value) -> Result<Value>;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        events: &EventMap,
        resource: Value,
    ) -> Result<TriggerOutput>;

    async fn apply_policy(&self, cancel: &CancellationToken, output: &TriggerOutput) -> Result<()>;
}

/// Status-code policy shared by the request/response backends. Without a policy any
/// 2xx counts as success.
pub(crate) fn apply_status_policy(
    kind: TriggerKind,
    policy: Option<&TriggerPolicy>,
    output: &TriggerOutput,
) -> Result<()> {
    let TriggerOutput::Http { status, body } = output else {
        return Ok(());
    };
    match policy.and_then(|p| p.status.as_ref()) {
        Some(status_policy) => policy::check_status(status_policy, *status),
        None if (200..300).contains(status) => Ok(()),
        None => Err(Error::Execution(format!(
            "{} trigger got status {}: {}",
            kind,
            status,
            body.chars().take(256).collect::<String>()
        ))),
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StatusPolicy;

    fn http(status: u16) -> TriggerOutput {
        TriggerOutput::Http {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn test_status_policy_defaults_to_2xx() {
        assert!(apply_status_policy(TriggerKind::Http, None, &http(204)).is_ok());
        assert!(matches!(
            apply_status_policy(TriggerKind::Http, None, &http(502)),
            Err(Error::Execution(_))
        ));
    }

    #[test]
    fn test_status_policy_allow_list() {
        let policy = TriggerPolicy {
            k8s: None,
            status: Some(StatusPolicy { allow: vec![200, 300] }),
        };
        assert!(apply_status_policy(TriggerKind::Http, Some(&policy), &http(200)).is_ok());
        assert!(apply_status_policy(TriggerKind::Http, Some(&policy), &http(300)).is_ok());
        assert!(apply_status_policy(TriggerKind::Http, Some(&policy), &http(500)).is_err());
        assert!(apply_status_policy(TriggerKind::Http, Some(&policy), &TriggerOutput::Ack).is_ok());
    }
}
