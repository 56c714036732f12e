use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{cancellable, params, EventMap, Trigger, TriggerOutput};
use crate::crd::{NatsTrigger as NatsConfig, TriggerKind};
use crate::{Error, Result};

/// Publishes a JSON payload on a NATS subject.
pub struct NatsTrigger {
    config: NatsConfig,
    client: async_nats::Client,
}

impl NatsTrigger {
    pub fn new(config: NatsConfig, client: async_nats::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Trigger for NatsTrigger {
    fn trigger_type(&self) -> TriggerKind {
        TriggerKind::Nats
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
        let config: NatsConfig = serde_json::from_value(resource)?;
        let payload = params::construct_payload(events, &config.payload)?;
        let bytes = serde_json::to_vec(&payload)?;

        info!(subject = %config.subject, "publishing nats trigger message");
        cancellable(cancel, async {
            self.client
                .publish(config.subject.clone(), bytes.into())
                .await
                .map_err(|e| Error::Nats(format!("publish to {} failed: {}", config.subject, e)))?;
            self.client
                .flush()
                .await
                .map_err(|e| Error::Nats(format!("flush failed: {}", e)))
        })
        .await?;

        Ok(TriggerOutput::Ack)
    }

    async fn apply_policy(&self, _cancel: &CancellationToken, _output: &TriggerOutput) -> Result<()> {
        Ok(())
    }
}
