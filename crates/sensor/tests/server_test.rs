use axum::http::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tripwire_sensor::{metrics, server::Server};

fn cloudevent(id: &str) -> serde_json::Value {
    json!({
        "specversion": "1.0",
        "id": id,
        "source": "webhook",
        "subject": "example",
        "type": "webhook",
        "datacontenttype": "application/json",
        "data": {"message": "hello"}
    })
}

#[tokio::test]
async fn test_server_endpoints() {
    metrics::register_metrics();
    let (queue, mut events) = mpsc::channel(8);
    let server = Server::new(queue);
    let app = server.build_router();

    // Use axum's test client
    let client = axum_test::TestServer::new(app).unwrap();

    // Test health endpoint
    let response = client.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");

    // Test event intake
    let response = client.post("/").json(&cloudevent("evt-1")).await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["id"], "evt-1");

    let event = events.recv().await.unwrap();
    assert_eq!(event.context.id, "evt-1");
    assert_eq!(event.context.source, "webhook");
    assert_eq!(event.data_as_json().unwrap(), json!({"message": "hello"}));

    // Test metrics endpoint
    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_event_is_rejected() {
    let (queue, mut events) = mpsc::channel(8);
    let client = axum_test::TestServer::new(Server::new(queue).build_router()).unwrap();

    let response = client.post("/").text("not a cloudevent").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("not valid JSON"));

    let response = client.post("/").json(&json!({"source": "webhook"})).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_closed_queue_is_unavailable() {
    let (queue, events) = mpsc::channel(8);
    drop(events);
    let client = axum_test::TestServer::new(Server::new(queue).build_router()).unwrap();

    let response = client.post("/").json(&cloudevent("evt-2")).await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}
