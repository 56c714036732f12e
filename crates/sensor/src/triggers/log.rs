use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{EventMap, Trigger, TriggerOutput};
use crate::crd::TriggerKind;
use crate::Result;

/// Writes the resolved events to the sensor log.
pub struct LogTrigger {
    name: String,
}

impl LogTrigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Trigger for LogTrigger {
    fn trigger_type(&self) -> TriggerKind {
        TriggerKind::Log
    }

    async fn fetch_resource(&self, _cancel: &CancellationToken) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn apply_resource_parameters(&self, _events: &EventMap, resource: Value) -> Result<Value> {
        Ok(resource)
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        events: &EventMap,
        _resource: Value,
    ) -> Result<TriggerOutput> {
        let mut names: Vec<&String> = events.keys().collect();
        names.sort();
        for dependency in names {
            let event = &events[dependency];
            info!(
                trigger = %self.name,
                dependency = %dependency,
                event_id = %event.context.id,
                source = %event.context.source,
                subject = %event.context.subject,
                data = %String::from_utf8_lossy(&event.data),
                "event"
            );
        }
        Ok(TriggerOutput::Ack)
    }

    async fn apply_policy(&self, _cancel: &CancellationToken, _output: &TriggerOutput) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::tests::event;

    #[tokio::test]
    async fn test_log_trigger_acks() {
        let trigger = LogTrigger::new("log");
        let mut events = EventMap::new();
        events.insert("dep".to_string(), event("1", "webhook", "example", "{}"));
        let cancel = CancellationToken::new();
        let resource = trigger.fetch_resource(&cancel).await.unwrap();
        let output = trigger.execute(&cancel, &events, resource).await.unwrap();
        assert_eq!(output, TriggerOutput::Ack);
    }
}
