use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{decode_cloudevent, enqueue};
use crate::crd::Event;
use crate::metrics::gather_metrics;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> String {
    gather_metrics()
}

pub async fn receive_event(State(queue): State<mpsc::Sender<Event>>, body: Bytes) -> Response {
    let event = match decode_cloudevent(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "rejecting malformed event");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };
    let id = event.context.id.clone();
    debug!(event_id = %id, source = %event.context.source, "received event");

    match enqueue(&queue, event).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response(),
        Err(e) => {
            warn!(event_id = %id, error = %e, "event queue unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
