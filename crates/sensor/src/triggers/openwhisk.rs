use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{apply_status_policy, cancellable, params, EventMap, Trigger, TriggerOutput};
use crate::crd::{OpenWhiskTrigger as OpenWhiskConfig, TriggerKind, TriggerPolicy};
use crate::secrets::SecretReader;
use crate::{Error, Result};

/// Invokes an Apache OpenWhisk action over its REST API.
pub struct OpenWhiskTrigger {
    config: OpenWhiskConfig,
    policy: Option<TriggerPolicy>,
    client: reqwest::Client,
    secrets: SecretReader,
}

impl OpenWhiskTrigger {
    pub fn new(
        config: OpenWhiskConfig,
        policy: Option<TriggerPolicy>,
        client: reqwest::Client,
        secrets: SecretReader,
    ) -> Self {
        Self {
            config,
            policy,
            client,
            secrets,
        }
    }
}

/// `{host}/api/{version}/namespaces/{namespace}/actions/{action}?blocking=true`
pub fn action_url(config: &OpenWhiskConfig) -> String {
    format!(
        "{}/api/{}/namespaces/{}/actions/{}?blocking=true",
        config.host.trim_end_matches('/'),
        config.version.as_deref().unwrap_or("v1"),
        config.namespace.as_deref().unwrap_or("_"),
        config.action_name
    )
}

#[async_trait]
impl Trigger for OpenWhiskTrigger {
    fn trigger_type(&self) -> TriggerKind {
        TriggerKind::OpenWhisk
    }

    async fn fetch_resource(&self, _cancel: &CancellationToken) -> Result<Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    async fn apply_resource_parameters(&self, events: &EventMap, resource: Value) -> Result<Value> {
        params::apply_params(resource, &self.config.parameters, events)
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        events: &EventMap,
        resource: Value,
    ) -> Result<TriggerOutput> {
        let config: OpenWhiskConfig = serde_json::from_value(resource)?;
        let payload = params::construct_payload(events, &config.payload)?;
        let url = action_url(&config);

        let mut request = self.client.post(&url).json(&payload);
        if let Some(selector) = &config.auth_token {
            // tokens are "user:key"
            let token = self.secrets.get(selector).await?;
            let (user, key) = token.split_once(':').ok_or_else(|| {
                Error::Config("openwhisk auth token must have the form user:key".to_string())
            })?;
            request = request.basic_auth(user, Some(key));
        }

        info!(action = %config.action_name, "invoking openwhisk action");
        let response = cancellable(cancel, async { Ok(request.send().await?) }).await?;
        let status = response.status().as_u16();
        let body = cancellable(cancel, async { Ok(response.text().await?) }).await?;
        Ok(TriggerOutput::Http { status, body })
    }

    async fn apply_policy(&self, _cancel: &CancellationToken, output: &TriggerOutput) -> Result<()> {
        apply_status_policy(TriggerKind::OpenWhisk, self.policy.as_ref(), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_url_defaults() {
        let config = OpenWhiskConfig {
            host: "https://whisk.local/".to_string(),
            version: None,
            namespace: None,
            action_name: "hello".to_string(),
            auth_token: None,
            payload: vec![],
            parameters: vec![],
        };
        assert_eq!(
            action_url(&config),
            "https://whisk.local/api/v1/namespaces/_/actions/hello?blocking=true"
        );
    }
}
