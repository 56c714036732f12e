use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

pub const MEDIA_TYPE_JSON: &str = "application/json";
pub const MEDIA_TYPE_YAML: &str = "application/yaml";

/// An event as delivered by the event bus. Immutable once received.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct Event {
    pub context: EventContext,

    /// Raw payload, base64 encoded on the wire
    #[serde(default, with = "base64_bytes")]
    #[schemars(with = "String")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct EventContext {
    /// Unique id of the event
    pub id: String,

    /// Name of the event source that emitted the event
    pub source: String,

    /// Name of the event within the event source
    #[serde(default)]
    pub subject: String,

    /// Event type, e.g. "webhook" or "calendar"
    #[serde(rename = "type", default)]
    pub event_type: String,

    #[serde(rename = "typeVersion", default, skip_serializing_if = "String::is_empty")]
    pub type_version: String,

    #[serde(rename = "specversion", default)]
    pub spec_version: String,

    #[serde(rename = "datacontenttype", default)]
    pub data_content_type: String,

    pub time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

impl Event {
    /// Render the payload as JSON according to its declared content type.
    /// The content type may carry parameters, e.g. `application/json; charset=utf-8`.
    pub fn data_as_json(&self) -> crate::Result<serde_json::Value> {
        let media_type = self
            .context
            .data_content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();

        match media_type {
            MEDIA_TYPE_JSON => serde_json::from_slice(&self.data)
                .map_err(|e| Error::Filter(format!("event data is not valid JSON: {}", e))),
            MEDIA_TYPE_YAML | "text/yaml" | "application/x-yaml" => {
                serde_yaml::from_slice::<serde_json::Value>(&self.data).map_err(|e| {
                    Error::Filter(format!("failed converting yaml event data to JSON: {}", e))
                })
            }
            other => Err(Error::Filter(format!(
                "unsupported event content type: {}",
                other
            ))),
        }
    }

    /// Event as a JSON document with the payload decoded where possible.
    pub fn to_json(&self) -> serde_json::Value {
        let data = self
            .data_as_json()
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&self.data).into_owned()));
        serde_json::json!({
            "context": self.context,
            "data": data,
        })
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// Reference to a key of a secret mounted into the sensor pod.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}
