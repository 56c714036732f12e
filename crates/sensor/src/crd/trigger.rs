use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::SecretKeySelector;
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct Trigger {
    /// Backend configuration of the trigger
    pub template: TriggerTemplate,

    /// Boolean expression over dependency and group names, e.g. "dep-a && (dep-b || group-c)".
    /// Defaults to every top-level dependency and group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,

    /// Parameters applied to the template itself before the backend is selected
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TriggerParameter>,

    /// Post-execution success criteria
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<TriggerPolicy>,

    /// Retries of the execute step
    #[serde(rename = "retryStrategy", skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<Backoff>,

    /// Percentage weight among mutually exclusive triggers. 0 means unweighted.
    #[serde(default)]
    pub weight: u32,

    /// Upper bound on how often the trigger executes
    #[serde(rename = "rateLimit", skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
pub enum RateLimitUnit {
    #[default]
    Second,
    Minute,
    Hour,
}

impl RateLimitUnit {
    pub fn period(self) -> std::time::Duration {
        match self {
            RateLimitUnit::Second => std::time::Duration::from_secs(1),
            RateLimitUnit::Minute => std::time::Duration::from_secs(60),
            RateLimitUnit::Hour => std::time::Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RateLimit {
    #[serde(default)]
    pub unit: RateLimitUnit,

    #[serde(rename = "requestsPerUnit")]
    pub requests_per_unit: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct TriggerTemplate {
    /// Unique name of the trigger within the sensor
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s: Option<K8sTrigger>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpTrigger>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kafka: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<NatsTrigger>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulsar: Option<serde_json::Value>,

    #[serde(rename = "awsLambda", skip_serializing_if = "Option::is_none")]
    pub aws_lambda: Option<serde_json::Value>,

    #[serde(rename = "azureEventHubs", skip_serializing_if = "Option::is_none")]
    pub azure_event_hubs: Option<serde_json::Value>,

    #[serde(rename = "azureServiceBus", skip_serializing_if = "Option::is_none")]
    pub azure_service_bus: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackTrigger>,

    #[serde(rename = "openWhisk", skip_serializing_if = "Option::is_none")]
    pub open_whisk: Option<OpenWhiskTrigger>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogTrigger>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<serde_json::Value>,

    #[serde(rename = "argoWorkflow", skip_serializing_if = "Option::is_none")]
    pub argo_workflow: Option<ArgoWorkflowTrigger>,

    #[serde(rename = "gcpCloudFunctions", skip_serializing_if = "Option::is_none")]
    pub gcp_cloud_functions: Option<serde_json::Value>,
}

/// Backend discriminant of a trigger template, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    K8s,
    Http,
    Kafka,
    Nats,
    Pulsar,
    AwsLambda,
    AzureEventHubs,
    AzureServiceBus,
    Slack,
    OpenWhisk,
    Custom,
    Log,
    Email,
    ArgoWorkflow,
    GcpCloudFunctions,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::K8s => "k8s",
            TriggerKind::Http => "http",
            TriggerKind::Kafka => "kafka",
            TriggerKind::Nats => "nats",
            TriggerKind::Pulsar => "pulsar",
            TriggerKind::AwsLambda => "awsLambda",
            TriggerKind::AzureEventHubs => "azureEventHubs",
            TriggerKind::AzureServiceBus => "azureServiceBus",
            TriggerKind::Slack => "slack",
            TriggerKind::OpenWhisk => "openWhisk",
            TriggerKind::Custom => "custom",
            TriggerKind::Log => "log",
            TriggerKind::Email => "email",
            TriggerKind::ArgoWorkflow => "argoWorkflow",
            TriggerKind::GcpCloudFunctions => "gcpCloudFunctions",
        };
        write!(f, "{}", name)
    }
}

impl TriggerTemplate {
    /// The single backend configured on this template.
    pub fn kind(&self) -> Result<TriggerKind> {
        let candidates = [
            (self.k8s.is_some(), TriggerKind::K8s),
            (self.http.is_some(), TriggerKind::Http),
            (self.kafka.is_some(), TriggerKind::Kafka),
            (self.nats.is_some(), TriggerKind::Nats),
            (self.pulsar.is_some(), TriggerKind::Pulsar),
            (self.aws_lambda.is_some(), TriggerKind::AwsLambda),
            (self.azure_event_hubs.is_some(), TriggerKind::AzureEventHubs),
            (self.azure_service_bus.is_some(), TriggerKind::AzureServiceBus),
            (self.slack.is_some(), TriggerKind::Slack),
            (self.open_whisk.is_some(), TriggerKind::OpenWhisk),
            (self.custom.is_some(), TriggerKind::Custom),
            (self.log.is_some(), TriggerKind::Log),
            (self.email.is_some(), TriggerKind::Email),
            (self.argo_workflow.is_some(), TriggerKind::ArgoWorkflow),
            (self.gcp_cloud_functions.is_some(), TriggerKind::GcpCloudFunctions),
        ];
        let set: Vec<TriggerKind> = candidates
            .iter()
            .filter(|(present, _)| *present)
            .map(|(_, kind)| *kind)
            .collect();

        match set.as_slice() {
            [kind] => Ok(*kind),
            [] => Err(Error::Validation(format!(
                "trigger '{}' does not configure a backend",
                self.name
            ))),
            many => Err(Error::Validation(format!(
                "trigger '{}' configures more than one backend: {}",
                self.name,
                many.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct TriggerParameter {
    /// Where the value comes from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<TriggerParameterSource>,

    /// JSON path of the field to set
    pub dest: String,

    #[serde(default)]
    pub operation: ParameterOperation,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct TriggerParameterSource {
    #[serde(rename = "dependencyName")]
    pub dependency_name: String,

    #[serde(rename = "contextKey", skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,

    #[serde(rename = "contextTemplate", skip_serializing_if = "Option::is_none")]
    pub context_template: Option<String>,

    #[serde(rename = "dataKey", skip_serializing_if = "Option::is_none")]
    pub data_key: Option<String>,

    #[serde(rename = "dataTemplate", skip_serializing_if = "Option::is_none")]
    pub data_template: Option<String>,

    /// Literal fallback when the event or path cannot be resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParameterOperation {
    #[default]
    Overwrite,
    Append,
    Prepend,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct TriggerPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s: Option<K8sResourcePolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusPolicy>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct K8sResourcePolicy {
    /// Labels the triggered resource must carry for the trigger to count as successful
    pub labels: BTreeMap<String, String>,

    pub backoff: Backoff,

    #[serde(rename = "errorOnBackoffTimeout", default)]
    pub error_on_backoff_timeout: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StatusPolicy {
    pub allow: Vec<u16>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct Backoff {
    /// Initial interval, e.g. "1s", "500ms"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
}

/// Where a resource template is read from. Exactly one field is set.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct ArtifactLocation {
    /// Inline YAML or JSON manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,

    /// Embedded manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileArtifact>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlArtifact>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub configmap: Option<ConfigMapArtifact>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct FileArtifact {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct UrlArtifact {
    pub path: String,

    #[serde(rename = "verifyCert", default = "default_true")]
    pub verify_cert: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ConfigMapArtifact {
    pub name: String,

    /// Defaults to the sensor namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum K8sOperation {
    #[default]
    Create,
    Update,
    Patch,
    Delete,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct K8sTrigger {
    #[serde(default)]
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. "deployments"
    pub resource: String,

    #[serde(default)]
    pub operation: K8sOperation,

    pub source: ArtifactLocation,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TriggerParameter>,

    /// merge (default), json or strategic
    #[serde(rename = "patchStrategy", skip_serializing_if = "Option::is_none")]
    pub patch_strategy: Option<String>,

    /// Fetch the live object from the cluster for update operations
    #[serde(rename = "liveObject", default)]
    pub live_object: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct HttpTrigger {
    pub url: String,

    /// Defaults to POST
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Request body fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<TriggerParameter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TriggerParameter>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Request timeout in seconds, 60 when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(rename = "basicAuth", skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct BasicAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<SecretKeySelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretKeySelector>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct NatsTrigger {
    pub url: String,
    pub subject: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<TriggerParameter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TriggerParameter>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct SlackTrigger {
    pub channel: String,
    pub message: String,

    #[serde(rename = "slackToken")]
    pub slack_token: SecretKeySelector,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TriggerParameter>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default, JsonSchema)]
pub struct LogTrigger {}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct OpenWhiskTrigger {
    pub host: String,

    /// API version, "v1" when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// "_" when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(rename = "actionName")]
    pub action_name: String,

    #[serde(rename = "authToken", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<SecretKeySelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<TriggerParameter>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TriggerParameter>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ArgoWorkflowOperation {
    #[default]
    Submit,
    Resubmit,
    Retry,
    Resume,
    Suspend,
    Terminate,
    Stop,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ArgoWorkflowTrigger {
    #[serde(default)]
    pub operation: ArgoWorkflowOperation,

    pub source: ArtifactLocation,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<TriggerParameter>,

    /// Extra arguments passed to the argo CLI
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_requires_exactly_one_backend() {
        let mut template = TriggerTemplate {
            name: "t".to_string(),
            ..Default::default()
        };
        assert!(template.kind().is_err());

        template.log = Some(LogTrigger {});
        assert_eq!(template.kind().unwrap(), TriggerKind::Log);

        template.kafka = Some(serde_json::json!({"topic": "x"}));
        let err = template.kind().unwrap_err().to_string();
        assert!(err.contains("kafka") && err.contains("log"));
    }

    #[test]
    fn test_trigger_deserializes_from_yaml() {
        let yaml = r#"
template:
  name: webhook
  http:
    url: http://example.com/hook
    payload:
      - src:
          dependencyName: dep-a
          dataKey: body.message
        dest: message
conditions: "dep-a && dep-b"
policy:
  status:
    allow: [200, 201]
weight: 30
"#;
        let trigger: Trigger = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(trigger.template.kind().unwrap(), TriggerKind::Http);
        assert_eq!(trigger.weight, 30);
        let http = trigger.template.http.unwrap();
        assert_eq!(http.payload[0].operation, ParameterOperation::Overwrite);
        assert_eq!(trigger.policy.unwrap().status.unwrap().allow, vec![200, 201]);
    }
}
