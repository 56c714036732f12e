use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{apply_status_policy, cancellable, params, EventMap, Trigger, TriggerOutput};
use crate::crd::{SlackTrigger as SlackConfig, TriggerKind, TriggerPolicy};
use crate::secrets::SecretReader;
use crate::{Error, Result};

/// Posts a message to a Slack channel through `chat.postMessage`.
pub struct SlackTrigger {
    config: SlackConfig,
    policy: Option<TriggerPolicy>,
    client: reqwest::Client,
    secrets: SecretReader,
    api_url: String,
}

impl SlackTrigger {
    pub fn new(
        config: SlackConfig,
        policy: Option<TriggerPolicy>,
        client: reqwest::Client,
        secrets: SecretReader,
        api_url: String,
    ) -> Self {
        Self {
            config,
            policy,
            client,
            secrets,
            api_url,
        }
    }
}

#[async_trait]
impl Trigger for SlackTrigger {
    fn trigger_type(&self) -> TriggerKind {
        TriggerKind::Slack
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
        _events: &EventMap,
        resource: Value,
    ) -> Result<TriggerOutput> {
        let config: SlackConfig = serde_json::from_value(resource)?;
        if config.channel.is_empty() || config.message.is_empty() {
            return Err(Error::Execution(
                "slack trigger needs a channel and a message".to_string(),
            ));
        }
        let token = self.secrets.get(&config.slack_token).await?;
        let channel = config.channel.trim_start_matches('#');

        info!(channel = %channel, "posting slack message");
        let response = cancellable(cancel, async {
            Ok(self
                .client
                .post(&self.api_url)
                .bearer_auth(token)
                .json(&json!({ "channel": channel, "text": config.message }))
                .send()
                .await?)
        })
        .await?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status < 300 && body.get("ok").and_then(Value::as_bool) != Some(true) {
            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Error::Execution(format!("slack rejected the message: {}", reason)));
        }

        Ok(TriggerOutput::Http {
            status,
            body: body.to_string(),
        })
    }

    async fn apply_policy(&self, _cancel: &CancellationToken, output: &TriggerOutput) -> Result<()> {
        apply_status_policy(TriggerKind::Slack, self.policy.as_ref(), output)
    }
}
