//! Backend selection and the per-sensor client cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::argo_workflow::ArgoWorkflowTrigger;
use super::http::HttpTrigger;
use super::k8s::K8sTrigger;
use super::log::LogTrigger;
use super::nats::NatsTrigger;
use super::openwhisk::OpenWhiskTrigger;
use super::policy::LabelSource;
use super::rate_limit::RateLimits;
use super::slack::SlackTrigger;
use super::Trigger;
use crate::artifact::ArtifactReader;
use crate::crd::{TriggerKind, TriggerPolicy, TriggerTemplate};
use crate::secrets::SecretReader;
use crate::{Error, Result};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);
pub const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Connections to stateful backends and trigger rate limiters, created once per trigger
/// name and reused for the lifetime of the sensor.
#[derive(Default)]
pub struct ClientCache {
    http: Mutex<HashMap<String, reqwest::Client>>,
    nats: Mutex<HashMap<String, async_nats::Client>>,
    rate_limits: RateLimits,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    pub async fn http_client(&self, trigger: &str) -> Result<reqwest::Client> {
        let mut clients = self.http.lock().await;
        if let Some(client) = clients.get(trigger) {
            return Ok(client.clone());
        }
        debug!(trigger = %trigger, "creating http client");
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()?;
        clients.insert(trigger.to_string(), client.clone());
        Ok(client)
    }

    pub async fn nats_client(&self, trigger: &str, url: &str) -> Result<async_nats::Client> {
        let mut clients = self.nats.lock().await;
        if let Some(client) = clients.get(trigger) {
            return Ok(client.clone());
        }
        info!(trigger = %trigger, url = %url, "connecting to nats");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Nats(format!("failed to connect to {}: {}", url, e)))?;
        clients.insert(trigger.to_string(), client.clone());
        Ok(client)
    }

    pub async fn cached_http_clients(&self) -> usize {
        self.http.lock().await.len()
    }
}

/// Everything backends need from the sensor process.
pub struct TriggerEnv {
    pub sensor: String,
    pub namespace: String,
    pub kube: Option<kube::Client>,
    pub secrets: SecretReader,
    pub labels: Option<Arc<dyn LabelSource>>,
    pub slack_api_url: String,
    pub argo_command: String,
}

impl TriggerEnv {
    pub fn new(
        sensor: impl Into<String>,
        namespace: impl Into<String>,
        kube: Option<kube::Client>,
        secrets: SecretReader,
    ) -> Self {
        let namespace = namespace.into();
        let labels: Option<Arc<dyn LabelSource>> = kube.clone().map(|client| {
            Arc::new(super::policy::KubeLabelSource::new(client, namespace.clone()))
                as Arc<dyn LabelSource>
        });
        Self {
            sensor: sensor.into(),
            namespace,
            kube,
            secrets,
            labels,
            slack_api_url: SLACK_POST_MESSAGE_URL.to_string(),
            argo_command: "argo".to_string(),
        }
    }

    fn artifacts(&self) -> ArtifactReader {
        ArtifactReader::new(self.kube.clone(), self.namespace.clone())
    }

    fn kube_client(&self, kind: TriggerKind) -> Result<kube::Client> {
        self.kube.clone().ok_or_else(|| {
            Error::Config(format!("{} trigger needs a Kubernetes client", kind))
        })
    }
}

pub struct TriggerRegistry {
    env: TriggerEnv,
    clients: Arc<ClientCache>,
}

impl TriggerRegistry {
    pub fn new(env: TriggerEnv, clients: Arc<ClientCache>) -> Self {
        Self { env, clients }
    }

    pub fn clients(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    /// Implementation for the template's backend, or `None` for backends this sensor
    /// cannot run.
    pub async fn get_trigger(
        &self,
        template: &TriggerTemplate,
        policy: Option<&TriggerPolicy>,
    ) -> Result<Option<Box<dyn Trigger>>> {
        let kind = template.kind()?;
        let policy = policy.cloned();
        let name = template.name.clone();

        let trigger: Box<dyn Trigger> = match kind {
            TriggerKind::K8s => match &template.k8s {
                Some(config) => Box::new(K8sTrigger::new(
                    self.env.sensor.clone(),
                    name,
                    config.clone(),
                    policy,
                    self.env.kube_client(kind)?,
                    self.env.namespace.clone(),
                    self.env.artifacts(),
                    self.env.labels.clone(),
                )),
                None => return Ok(None),
            },
            TriggerKind::Http => match &template.http {
                Some(config) => Box::new(HttpTrigger::new(
                    config.clone(),
                    policy,
                    self.clients.http_client(&name).await?,
                    self.env.secrets.clone(),
                )),
                None => return Ok(None),
            },
            TriggerKind::Nats => match &template.nats {
                Some(config) => Box::new(NatsTrigger::new(
                    config.clone(),
                    self.clients.nats_client(&name, &config.url).await?,
                )),
                None => return Ok(None),
            },
            TriggerKind::Slack => match &template.slack {
                Some(config) => Box::new(SlackTrigger::new(
                    config.clone(),
                    policy,
                    self.clients.http_client(&name).await?,
                    self.env.secrets.clone(),
                    self.env.slack_api_url.clone(),
                )),
                None => return Ok(None),
            },
            TriggerKind::OpenWhisk => match &template.open_whisk {
                Some(config) => Box::new(OpenWhiskTrigger::new(
                    config.clone(),
                    policy,
                    self.clients.http_client(&name).await?,
                    self.env.secrets.clone(),
                )),
                None => return Ok(None),
            },
            TriggerKind::Log => Box::new(LogTrigger::new(name)),
            TriggerKind::ArgoWorkflow => match &template.argo_workflow {
                Some(config) => Box::new(ArgoWorkflowTrigger::new(
                    self.env.sensor.clone(),
                    name,
                    config.clone(),
                    policy,
                    self.env.namespace.clone(),
                    self.env.argo_command.clone(),
                    self.env.artifacts(),
                    self.env.kube.clone(),
                    self.env.labels.clone(),
                )),
                None => return Ok(None),
            },
            TriggerKind::Kafka
            | TriggerKind::Pulsar
            | TriggerKind::AwsLambda
            | TriggerKind::AzureEventHubs
            | TriggerKind::AzureServiceBus
            | TriggerKind::Custom
            | TriggerKind::Email
            | TriggerKind::GcpCloudFunctions => {
                debug!(trigger = %template.name, kind = %kind, "no backend available");
                return Ok(None);
            }
        };
        Ok(Some(trigger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{HttpTrigger as HttpConfig, LogTrigger as LogConfig};
    use std::collections::BTreeMap;

    fn registry() -> TriggerRegistry {
        TriggerRegistry::new(
            TriggerEnv::new("sensor", "default", None, SecretReader::new("/nonexistent")),
            Arc::new(ClientCache::new()),
        )
    }

    fn http_template(name: &str) -> TriggerTemplate {
        TriggerTemplate {
            name: name.to_string(),
            http: Some(HttpConfig {
                url: "http://localhost:1/hook".to_string(),
                method: None,
                payload: vec![],
                parameters: vec![],
                headers: BTreeMap::new(),
                timeout: None,
                basic_auth: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dispatches_on_kind() {
        let registry = registry();
        let log = TriggerTemplate {
            name: "log".to_string(),
            log: Some(LogConfig {}),
            ..Default::default()
        };
        let trigger = registry.get_trigger(&log, None).await.unwrap().unwrap();
        assert_eq!(trigger.trigger_type(), TriggerKind::Log);

        let trigger = registry
            .get_trigger(&http_template("web"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trigger.trigger_type(), TriggerKind::Http);
    }

    #[tokio::test]
    async fn test_opaque_backends_have_no_implementation() {
        let registry = registry();
        let kafka = TriggerTemplate {
            name: "kafka".to_string(),
            kafka: Some(serde_json::json!({"url": "kafka:9092", "topic": "t"})),
            ..Default::default()
        };
        assert!(registry.get_trigger(&kafka, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_clients_are_cached_per_trigger_name() {
        let registry = registry();
        for _ in 0..3 {
            registry.get_trigger(&http_template("a"), None).await.unwrap();
        }
        registry.get_trigger(&http_template("b"), None).await.unwrap();
        assert_eq!(registry.clients().cached_http_clients().await, 2);
    }

    #[tokio::test]
    async fn test_k8s_trigger_without_client_is_config_error() {
        let registry = registry();
        let template: TriggerTemplate = serde_json::from_value(serde_json::json!({
            "name": "create-pod",
            "k8s": {
                "version": "v1",
                "resource": "pods",
                "source": {"inline": "kind: Pod"}
            }
        }))
        .unwrap();
        assert!(matches!(
            registry.get_trigger(&template, None).await,
            Err(Error::Config(_))
        ));
    }
}
