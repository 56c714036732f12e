mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::crd::Event;
use crate::{Error, Result};

/// HTTP event receiver: CloudEvents in on `POST /`, plus health and metrics.
pub struct Server {
    queue: mpsc::Sender<Event>,
}

impl Server {
    pub fn new(queue: mpsc::Sender<Event>) -> Self {
        Self { queue }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/", post(routes::receive_event))
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.queue)
    }

    /// Serve until `cancel` fires.
    pub async fn start(self, addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {}: {}", addr, e)))?;
        info!(addr = %addr, "event receiver listening");
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_router_accepts_event() {
        let (queue, mut events) = mpsc::channel(1);
        let router = Server::new(queue).build_router();
        let request = Request::post("/")
            .header("content-type", "application/cloudevents+json")
            .body(Body::from(r#"{"id": "evt-1", "source": "webhook", "subject": "example"}"#))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let event = tokio_test::assert_ok!(events.try_recv());
        assert_eq!(event.context.subject, "example");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (queue, _events) = mpsc::channel(1);
        let response = Server::new(queue)
            .build_router()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
