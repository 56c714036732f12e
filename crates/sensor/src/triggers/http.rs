use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{apply_status_policy, cancellable, params, EventMap, Trigger, TriggerOutput};
use crate::crd::{HttpTrigger as HttpConfig, TriggerKind, TriggerPolicy};
use crate::secrets::SecretReader;
use crate::{Error, Result};

/// Sends an HTTP request built from the resolved events.
pub struct HttpTrigger {
    config: HttpConfig,
    policy: Option<TriggerPolicy>,
    client: reqwest::Client,
    secrets: SecretReader,
}

impl HttpTrigger {
    pub fn new(
        config: HttpConfig,
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

#[async_trait]
impl Trigger for HttpTrigger {
    fn trigger_type(&self) -> TriggerKind {
        TriggerKind::Http
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
        let config: HttpConfig = serde_json::from_value(resource)?;

        let method = match config.method.as_deref() {
            Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
                .map_err(|_| Error::Execution(format!("invalid http method '{}'", m)))?,
            None => Method::POST,
        };

        let mut request = self.client.request(method.clone(), &config.url);
        if let Some(timeout) = config.timeout {
            request = request.timeout(Duration::from_secs(timeout));
        }
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(auth) = &config.basic_auth {
            let username = match &auth.username {
                Some(s) => self.secrets.get(s).await?,
                None => String::new(),
            };
            let password = match &auth.password {
                Some(s) => Some(self.secrets.get(s).await?),
                None => None,
            };
            request = request.basic_auth(username, password);
        }
        if !config.payload.is_empty() {
            let payload = params::construct_payload(events, &config.payload)?;
            request = request.json(&payload);
        }

        info!(url = %config.url, method = %method, "sending http trigger request");
        let response = cancellable(cancel, async { Ok(request.send().await?) }).await?;
        let status = response.status().as_u16();
        let body = cancellable(cancel, async { Ok(response.text().await?) }).await?;
        info!(url = %config.url, status, "http trigger response");

        Ok(TriggerOutput::Http { status, body })
    }

    async fn apply_policy(&self, _cancel: &CancellationToken, output: &TriggerOutput) -> Result<()> {
        apply_status_policy(TriggerKind::Http, self.policy.as_ref(), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::tests::event;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one response and closes the connection.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    fn trigger(url: String) -> HttpTrigger {
        let config: HttpConfig = serde_json::from_value(serde_json::json!({ "url": url })).unwrap();
        HttpTrigger::new(
            config,
            None,
            reqwest::Client::new(),
            SecretReader::new("/nonexistent"),
        )
    }

    fn events() -> EventMap {
        let mut events = EventMap::new();
        events.insert("dep".to_string(), event("1", "webhook", "example", r#"{"x": 1}"#));
        events
    }

    #[tokio::test]
    async fn test_returns_status_and_body() {
        let url = serve_once("HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok").await;
        let trigger = trigger(url);
        let cancel = CancellationToken::new();
        let resource = trigger.fetch_resource(&cancel).await.unwrap();
        let output = trigger.execute(&cancel, &events(), resource).await.unwrap();
        assert_eq!(
            output,
            TriggerOutput::Http {
                status: 201,
                body: "ok".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort").await;
        let trigger = trigger(url);
        let cancel = CancellationToken::new();
        let resource = trigger.fetch_resource(&cancel).await.unwrap();
        let result = trigger.execute(&cancel, &events(), resource).await;
        assert!(matches!(result, Err(Error::Http(_))));
    }
}
