//! HttpDispatcher against a mock upstream: request shape, error mapping,
//! SSE streaming and health probes.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use service_gateway::models::invocation::{StreamEvent, StreamFailure};
use service_gateway::models::service::{ApiKey, HealthStatus};
use service_gateway::proxy::session::{CancelSignal, SessionManager};
use service_gateway::proxy::upstream::{Dispatcher, HttpDispatcher, UpstreamTarget};

fn dispatcher() -> HttpDispatcher {
    HttpDispatcher::new(Duration::from_secs(5), 0).unwrap()
}

fn target(server: &MockServer, key: Option<&str>) -> UpstreamTarget {
    UpstreamTarget {
        service: "screen-intelligence".into(),
        endpoint: format!("{}/v1/invoke", server.uri()),
        api_key: key.map(ApiKey::new),
    }
}

#[tokio::test]
async fn test_call_sends_action_payload_and_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/invoke"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_json(json!({
            "action": "screen.describe",
            "payload": {"detail": "high"},
            "stream": false,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "a terminal window"})))
        .expect(1)
        .mount(&server)
        .await;

    let out = dispatcher()
        .call(&target(&server, Some("sk-test")), "screen.describe", &json!({"detail": "high"}))
        .await
        .unwrap();
    assert_eq!(out, json!({"text": "a terminal window"}));
}

#[tokio::test]
async fn test_non_2xx_is_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = dispatcher()
        .call(&target(&server, None), "screen.describe", &json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "UpstreamError");
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_upstream_error() {
    let t = UpstreamTarget {
        service: "gone".into(),
        endpoint: "http://127.0.0.1:1/v1/invoke".into(),
        api_key: None,
    };
    let err = dispatcher().call(&t, "x.y", &json!({})).await.unwrap_err();
    assert_eq!(err.kind(), "UpstreamError");
}

#[tokio::test]
async fn test_stream_decodes_sse_frames_in_order() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"type\":\"early-response\",\"data\":{\"ack\":true}}\n\n",
        ": keep-alive\n\n",
        "data: {\"type\":\"progress\",\"data\":{\"pct\":50}}\n\n",
        "data: {\"type\":\"token\",\"data\":\"hi\"}\n\n",
        "data: {\"type\":\"completion\",\"data\":{\"text\":\"hi\"}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/invoke"))
        .and(header("accept", "text/event-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let (id, sink, cancel) = sessions.open();
    let mut rx = sessions.subscribe(&id).unwrap();

    dispatcher()
        .stream(&target(&server, None), "screen.describe", &json!({}), sink.clone(), cancel)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert_eq!(
        events,
        vec![
            StreamEvent::EarlyResponse(json!({"ack": true})),
            StreamEvent::Progress(json!({"pct": 50})),
            StreamEvent::Token("hi".into()),
            StreamEvent::Completion(json!({"text": "hi"})),
        ]
    );
    assert!(!sink.is_open());
}

#[tokio::test]
async fn test_stream_without_completion_leaves_session_open() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"type\":\"token\",\"data\":\"par\"}\n\n",
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let (_, sink, _) = sessions.open();

    dispatcher()
        .stream(&target(&server, None), "screen.describe", &json!({}), sink.clone(), CancelSignal::never())
        .await
        .unwrap();
    // The gateway turns this into a StreamAborted error.
    assert!(sink.is_open());
}

#[tokio::test]
async fn test_stream_error_status_is_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let (_, sink, cancel) = sessions.open();
    let err = dispatcher()
        .stream(&target(&server, None), "screen.describe", &json!({}), sink, cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "UpstreamError");
}

#[tokio::test]
async fn test_upstream_error_event_is_passed_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"type\":\"error\",\"data\":{\"reason\":\"model_failed\",\"message\":\"oom\"}}\n\n",
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let (id, sink, cancel) = sessions.open();
    let mut rx = sessions.subscribe(&id).unwrap();
    dispatcher()
        .stream(&target(&server, None), "screen.describe", &json!({}), sink, cancel)
        .await
        .unwrap();

    assert_eq!(
        rx.try_recv().unwrap(),
        StreamEvent::Error(StreamFailure::new("model_failed", "oom"))
    );
}

#[tokio::test]
async fn test_probe_maps_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    assert_eq!(dispatcher().probe(&target(&server, None)).await, HealthStatus::Healthy);

    let degraded = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&degraded)
        .await;
    assert_eq!(dispatcher().probe(&target(&degraded, None)).await, HealthStatus::Degraded);

    let gone = UpstreamTarget {
        service: "gone".into(),
        endpoint: "http://127.0.0.1:1/v1/invoke".into(),
        api_key: None,
    };
    assert_eq!(dispatcher().probe(&gone).await, HealthStatus::Down);
}
