use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crd::Sensor;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[serde(rename = "kubernetes")]
    #[default]
    Kubernetes,
    #[serde(rename = "memory")]
    Memory,
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(StoreKind::Kubernetes),
            "memory" => Ok(StoreKind::Memory),
            other => Err(Error::Config(format!("unknown sensor store '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub kube: KubeConfig,
    pub store: StoreKind,
    pub bus: BusConfig,
    pub listener: ListenerConfig,
    pub persistence: RetryConfig,
    pub secrets_path: PathBuf,
    /// Base64 encoded JSON or YAML sensor object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_object: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    pub nats_url: Option<String>,
    pub nats_subject: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Number of filter worker shards
    pub workers: usize,
    pub queue_size: usize,
}

/// Bounded exponential retry of status persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub steps: u32,
    pub initial_ms: u64,
    pub factor: f64,
}

impl RetryConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:9300".to_string(),
            },
            kube: KubeConfig {
                namespace: "default".to_string(),
            },
            store: StoreKind::Kubernetes,
            bus: BusConfig::default(),
            listener: ListenerConfig {
                workers: 4,
                queue_size: 1024,
            },
            persistence: RetryConfig {
                steps: 5,
                initial_ms: 100,
                factor: 2.0,
            },
            secrets_path: PathBuf::from("/tripwire/secrets"),
            sensor_object: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = Config::default();
        let config = Config {
            server: ServerConfig {
                addr: std::env::var("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
            kube: KubeConfig {
                namespace: std::env::var("KUBE_NAMESPACE").unwrap_or(defaults.kube.namespace),
            },
            store: env_parse("SENSOR_STORE", defaults.store)?,
            bus: BusConfig {
                nats_url: std::env::var("NATS_URL").ok().filter(|s| !s.is_empty()),
                nats_subject: std::env::var("NATS_SUBJECT").ok().filter(|s| !s.is_empty()),
            },
            listener: ListenerConfig {
                workers: env_parse("LISTENER_WORKERS", defaults.listener.workers)?,
                queue_size: env_parse("EVENT_QUEUE_SIZE", defaults.listener.queue_size)?,
            },
            persistence: RetryConfig {
                steps: env_parse("PERSIST_RETRY_STEPS", defaults.persistence.steps)?,
                initial_ms: env_parse("PERSIST_RETRY_INITIAL_MS", defaults.persistence.initial_ms)?,
                factor: env_parse("PERSIST_RETRY_FACTOR", defaults.persistence.factor)?,
            },
            secrets_path: std::env::var("SECRETS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.secrets_path),
            sensor_object: std::env::var("SENSOR_OBJECT").ok().filter(|s| !s.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener.workers == 0 {
            return Err(Error::Config("LISTENER_WORKERS must be at least 1".to_string()));
        }
        if self.listener.queue_size == 0 {
            return Err(Error::Config("EVENT_QUEUE_SIZE must be at least 1".to_string()));
        }
        if self.persistence.factor < 1.0 {
            return Err(Error::Config("PERSIST_RETRY_FACTOR must be >= 1.0".to_string()));
        }
        if self.bus.nats_url.is_some() != self.bus.nats_subject.is_some() {
            tracing::warn!("NATS_URL and NATS_SUBJECT must both be set; NATS subscription disabled");
        }
        Ok(())
    }

    /// Decode the sensor carried in `SENSOR_OBJECT`, if any.
    pub fn sensor(&self) -> Result<Option<Sensor>> {
        match &self.sensor_object {
            Some(encoded) => {
                let raw = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| Error::Config(format!("SENSOR_OBJECT is not base64: {}", e)))?;
                parse_sensor(&raw).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Parse a sensor object from JSON or YAML.
pub fn parse_sensor(raw: &[u8]) -> Result<Sensor> {
    serde_yaml::from_slice(raw).map_err(|e| Error::Config(format!("invalid sensor object: {}", e)))
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {}: {}", name, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR_YAML: &str = r#"
apiVersion: tripwire.io/v1alpha1
kind: Sensor
metadata:
  name: webhook-sensor
  namespace: default
spec:
  dependencies:
    - name: dep-a
      eventSourceName: webhook
      eventName: example
  triggers:
    - template:
        name: log-it
        log: {}
"#;

    #[test]
    fn test_store_kind_from_str() {
        assert_eq!("memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert_eq!("Kubernetes".parse::<StoreKind>().unwrap(), StoreKind::Kubernetes);
        assert!("etcd".parse::<StoreKind>().is_err());
    }

    #[test]
    fn test_sensor_object_decodes_base64_yaml() {
        let config = Config {
            sensor_object: Some(STANDARD.encode(SENSOR_YAML)),
            ..Config::default()
        };
        let sensor = config.sensor().unwrap().unwrap();
        assert_eq!(sensor.metadata.name.as_deref(), Some("webhook-sensor"));
        assert_eq!(sensor.spec.dependencies.len(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.listener.workers = 0;
        assert!(config.validate().is_err());
    }
}
