use std::path::{Path, PathBuf};

use crate::crd::SecretKeySelector;
use crate::{Error, Result};

/// Reads secrets mounted into the sensor pod at `{root}/{name}/{key}`.
#[derive(Debug, Clone)]
pub struct SecretReader {
    root: PathBuf,
}

impl SecretReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, selector: &SecretKeySelector) -> PathBuf {
        self.root.join(&selector.name).join(&selector.key)
    }

    pub async fn get(&self, selector: &SecretKeySelector) -> Result<String> {
        let path = self.path_for(selector);
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::Config(format!(
                "failed to read secret {}/{} at {}: {}",
                selector.name,
                selector.key,
                path.display(),
                e
            ))
        })?;
        // editors leave a trailing newline in mounted files
        Ok(data.strip_suffix('\n').unwrap_or(&data).to_string())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
