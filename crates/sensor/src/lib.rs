pub mod artifact;
pub mod bus;
pub mod config;
pub mod crd;
pub mod jsonpath;
pub mod metrics;
pub mod secrets;
pub mod sensor;
pub mod server;
pub mod template;
pub mod triggers;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Filter error: {0}")]
    Filter(String),
    #[error("Parameter error: {0}")]
    Parameter(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Policy error: {0}")]
    Policy(String),
    #[error("timed out waiting for the condition")]
    BackoffTimeout,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("NATS error: {0}")]
    Nats(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that a retry may clear: API hiccups, connection resets, conflicts.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::Http(_) | Error::Nats(_) | Error::Io(_) => true,
            Error::Kubernetes(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            Error::Kubernetes(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
