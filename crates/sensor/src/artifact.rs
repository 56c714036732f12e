//! Resource templates for Kubernetes and workflow triggers.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

use crate::crd::ArtifactLocation;
use crate::{Error, Result};

/// Reads a resource template from wherever its location points.
#[derive(Clone)]
pub struct ArtifactReader {
    kube: Option<Client>,
    namespace: String,
}

impl ArtifactReader {
    pub fn new(kube: Option<Client>, namespace: impl Into<String>) -> Self {
        Self {
            kube,
            namespace: namespace.into(),
        }
    }

    pub async fn read(&self, location: &ArtifactLocation) -> Result<Value> {
        if let Some(inline) = &location.inline {
            return decode(inline);
        }
        if let Some(resource) = &location.resource {
            return Ok(resource.clone());
        }
        if let Some(file) = &location.file {
            debug!(path = %file.path, "reading resource from file");
            let content = tokio::fs::read_to_string(&file.path).await.map_err(|e| {
                Error::Execution(format!("failed to read resource file {}: {}", file.path, e))
            })?;
            return decode(&content);
        }
        if let Some(url) = &location.url {
            debug!(url = %url.path, "fetching resource from url");
            let client = reqwest::Client::builder()
                .danger_accept_invalid_certs(!url.verify_cert)
                .build()?;
            let response = client.get(&url.path).send().await?.error_for_status()?;
            return decode(&response.text().await?);
        }
        if let Some(cm) = &location.configmap {
            let client = self.kube.clone().ok_or_else(|| {
                Error::Config("configmap resource source needs a Kubernetes client".to_string())
            })?;
            let namespace = cm.namespace.as_deref().unwrap_or(&self.namespace);
            let api: Api<ConfigMap> = Api::namespaced(client, namespace);
            let config_map = api.get(&cm.name).await?;
            let content = config_map
                .data
                .and_then(|mut data| data.remove(&cm.key))
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "key '{}' in configmap {}/{}",
                        cm.key, namespace, cm.name
                    ))
                })?;
            return decode(&content);
        }
        Err(Error::Validation(
            "resource source does not set inline, resource, file, url or configmap".to_string(),
        ))
    }
}

/// YAML is a superset of JSON, so one decoder covers both.
fn decode(content: &str) -> Result<Value> {
    let value: Value = serde_yaml::from_str(content)?;
    if !value.is_object() {
        return Err(Error::Execution(
            "resource template must be an object".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::FileArtifact;
    use serde_json::json;

    #[tokio::test]
    async fn test_inline_yaml_and_json() {
        let reader = ArtifactReader::new(None, "default");
        let yaml = ArtifactLocation {
            inline: Some("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n".to_string()),
            ..Default::default()
        };
        assert_eq!(reader.read(&yaml).await.unwrap()["kind"], "ConfigMap");

        let json_loc = ArtifactLocation {
            inline: Some(r#"{"kind": "Pod"}"#.to_string()),
            ..Default::default()
        };
        assert_eq!(reader.read(&json_loc).await.unwrap(), json!({"kind": "Pod"}));
    }

    #[tokio::test]
    async fn test_file_source() {
        let path = std::env::temp_dir().join(format!("tripwire-artifact-{}.yaml", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "kind: Job\n").await.unwrap();
        let reader = ArtifactReader::new(None, "default");
        let loc = ArtifactLocation {
            file: Some(FileArtifact {
                path: path.display().to_string(),
            }),
            ..Default::default()
        };
        assert_eq!(reader.read(&loc).await.unwrap()["kind"], "Job");
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_scalar_template_is_rejected() {
        let reader = ArtifactReader::new(None, "default");
        let loc = ArtifactLocation {
            inline: Some("just a string".to_string()),
            ..Default::default()
        };
        assert!(reader.read(&loc).await.is_err());
        assert!(reader.read(&ArtifactLocation::default()).await.is_err());
    }
}
