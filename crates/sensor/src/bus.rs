//! Event bus adapters. Every adapter decodes CloudEvents and feeds the same bounded
//! queue the listener consumes.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{Event, EventContext, MEDIA_TYPE_JSON};
use crate::{Error, Result};

/// Attributes that map onto [`EventContext`] fields rather than extensions.
const CONTEXT_ATTRIBUTES: &[&str] = &[
    "id",
    "source",
    "subject",
    "type",
    "specversion",
    "datacontenttype",
    "time",
    "data",
    "data_base64",
    "dataschema",
];

/// Decode a structured-mode CloudEvent. `data` may be any JSON value or a string;
/// binary payloads travel as `data_base64`.
pub fn decode_cloudevent(raw: &[u8]) -> Result<Event> {
    let document: Value = serde_json::from_slice(raw)
        .map_err(|e| Error::Validation(format!("event is not valid JSON: {}", e)))?;
    let Value::Object(attributes) = document else {
        return Err(Error::Validation("event must be a JSON object".to_string()));
    };

    let text = |name: &str| attributes.get(name).and_then(Value::as_str).map(str::to_string);
    let required = |name: &str| {
        text(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Validation(format!("event has no '{}' attribute", name)))
    };

    let time = match text("time") {
        Some(t) => DateTime::parse_from_rfc3339(&t)
            .map_err(|e| Error::Validation(format!("invalid event time '{}': {}", t, e)))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let data = match (attributes.get("data_base64"), attributes.get("data")) {
        (Some(Value::String(encoded)), _) => STANDARD
            .decode(encoded)
            .map_err(|e| Error::Validation(format!("invalid data_base64: {}", e)))?,
        (_, Some(Value::String(s))) => s.as_bytes().to_vec(),
        (_, Some(Value::Null)) | (_, None) => Vec::new(),
        (_, Some(value)) => serde_json::to_vec(value)?,
    };

    let extensions: BTreeMap<String, String> = attributes
        .iter()
        .filter(|(k, _)| !CONTEXT_ATTRIBUTES.contains(&k.as_str()))
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k.clone(), s.clone())),
            Value::Number(n) => Some((k.clone(), n.to_string())),
            Value::Bool(b) => Some((k.clone(), b.to_string())),
            _ => None,
        })
        .collect();

    Ok(Event {
        context: EventContext {
            id: required("id")?,
            source: required("source")?,
            subject: text("subject").unwrap_or_default(),
            event_type: text("type").unwrap_or_default(),
            type_version: String::new(),
            spec_version: text("specversion").unwrap_or_else(|| "1.0".to_string()),
            data_content_type: text("datacontenttype").unwrap_or_else(|| MEDIA_TYPE_JSON.to_string()),
            time,
            extensions,
        },
        data,
    })
}

/// Hand an event to the listener, waiting for queue space.
pub async fn enqueue(queue: &mpsc::Sender<Event>, event: Event) -> Result<()> {
    queue
        .send(event)
        .await
        .map_err(|_| Error::Internal("event queue is closed".to_string()))
}

/// Forward CloudEvents published on `subject` to the listener until cancelled.
pub async fn run_nats_subscriber(
    client: async_nats::Client,
    subject: String,
    queue: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut subscriber = client
        .subscribe(subject.clone())
        .await
        .map_err(|e| Error::Nats(format!("failed to subscribe to {}: {}", subject, e)))?;
    info!(subject = %subject, "subscribed to nats event bus");

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscriber.next() => match message {
                Some(message) => message,
                None => {
                    warn!(subject = %subject, "nats subscription closed");
                    break;
                }
            },
        };
        match decode_cloudevent(&message.payload) {
            Ok(event) => {
                debug!(event_id = %event.context.id, "received event from nats");
                if enqueue(&queue, event).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(subject = %subject, error = %e, "dropping undecodable nats message"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_json_data() {
        let raw = json!({
            "specversion": "1.0",
            "id": "evt-1",
            "source": "webhook",
            "subject": "example",
            "type": "webhook",
            "time": "2024-05-01T10:00:00Z",
            "data": {"body": {"x": 1}},
            "region": "eu",
            "attempt": 2
        });
        let event = decode_cloudevent(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.context.id, "evt-1");
        assert_eq!(event.context.subject, "example");
        assert_eq!(event.context.data_content_type, MEDIA_TYPE_JSON);
        assert_eq!(event.data_as_json().unwrap(), json!({"body": {"x": 1}}));
        assert_eq!(event.context.extensions.get("region").map(String::as_str), Some("eu"));
        assert_eq!(event.context.extensions.get("attempt").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_decode_base64_and_string_data() {
        let raw = json!({
            "id": "evt-2",
            "source": "calendar",
            "datacontenttype": "application/yaml",
            "data_base64": STANDARD.encode("a: 1\n")
        });
        let event = decode_cloudevent(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.data, b"a: 1\n");

        let raw = json!({"id": "evt-3", "source": "s", "datacontenttype": "text/plain", "data": "hello"});
        let event = decode_cloudevent(raw.to_string().as_bytes()).unwrap();
        assert_eq!(event.data, b"hello");
    }

    #[test]
    fn test_decode_rejects_incomplete_events() {
        assert!(matches!(
            decode_cloudevent(br#"{"source": "s"}"#),
            Err(Error::Validation(_))
        ));
        assert!(decode_cloudevent(b"[1, 2]").is_err());
        assert!(decode_cloudevent(br#"{"id": "1", "source": "s", "time": "yesterday"}"#).is_err());
    }
}
