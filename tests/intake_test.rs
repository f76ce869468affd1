use std::time::Duration;

use apm_transport::{
    Config, EventKind, FlushOptions, Transport, TransportEvent,
};
use axum::http::StatusCode;
use serde_json::json;
use serial_test::serial;

mod common;

use common::RecordingServer;

#[tokio::test]
#[serial]
async fn test_window_time_uncorks_single_upload() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(Config {
        buffer_window_size: 3,
        buffer_window_time: 20,
        ..common::config(server.url())
    })
    .expect("Failed to create transport");

    transport.send_span(&json!({ "name": "first", "type": "custom" }));
    transport.send_span(&json!({ "name": "second", "type": "custom" }));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let requests = server.intake_requests();
    assert_eq!(requests.len(), 1);
    let events = requests[0].events();
    assert_eq!(events.len(), 3);
    assert!(events[0].get("metadata").is_some());
    assert_eq!(events[1]["span"]["name"], "first");
    assert_eq!(events[2]["span"]["name"], "second");
    assert_eq!(transport.sent(), 2);
    transport.end().await;
}

#[tokio::test]
#[serial]
async fn test_intake_request_headers() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(Config {
        secret_token: Some("secret".to_string()),
        ..common::config(server.url())
    })
    .expect("Failed to create transport");

    transport.send_transaction(&json!({ "name": "GET /", "type": "request" }));
    transport
        .flush(FlushOptions::default())
        .await
        .expect("Failed to flush");

    let requests = server.intake_requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.query, None);
    assert_eq!(request.header("content-type"), Some("application/x-ndjson"));
    assert_eq!(request.header("content-encoding"), Some("gzip"));
    assert_eq!(request.header("accept"), Some("application/json"));
    assert_eq!(request.header("authorization"), Some("Bearer secret"));
    assert_eq!(
        request.header("user-agent"),
        Some("apm-agent-rust/1.2.3 (my-service 1.0.0)")
    );
    transport.end().await;
}

#[tokio::test]
#[serial]
async fn test_server_url_path_prefix_is_kept() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(common::config(format!("{}/proxy/", server.url())))
        .expect("Failed to create transport");

    transport.send_error(&json!({ "culprit": "main" }));
    transport
        .flush(FlushOptions::default())
        .await
        .expect("Failed to flush");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/proxy/intake/v2/events");
    transport.end().await;
}

#[tokio::test]
#[serial]
async fn test_deferred_extra_metadata() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(Config {
        expect_extra_metadata: true,
        ..common::config(server.url())
    })
    .expect("Failed to create transport");

    transport.set_extra_metadata(json!({ "foo": "bar" }));
    transport.send_span(&json!({ "name": "s" }));
    transport
        .flush(FlushOptions::default())
        .await
        .expect("Failed to flush");

    let requests = server.intake_requests();
    assert_eq!(requests.len(), 1);
    let metadata = &requests[0].events()[0]["metadata"];
    assert_eq!(metadata["foo"], "bar");
    assert_eq!(metadata["service"]["name"], "my-service");
    assert_eq!(metadata["service"]["agent"]["name"], "rust");
    transport.end().await;
}

#[tokio::test]
#[serial]
async fn test_records_are_truncated() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(Config {
        keyword_max_length: 3,
        ..common::config(server.url())
    })
    .expect("Failed to create transport");

    transport.send_transaction(&json!({
        "name": "foo🎉bar",
        "context": { "custom": { "nested": { "a": 1 } } }
    }));
    transport
        .flush(FlushOptions::default())
        .await
        .expect("Failed to flush");

    let events = server.intake_requests()[0].events();
    assert_eq!(events[1]["transaction"]["name"], "foo");
    assert_eq!(
        events[1]["transaction"]["context"]["custom"]["nested"],
        "[object Object]"
    );
    transport.end().await;
}

#[tokio::test]
#[serial]
async fn test_rejected_upload_reports_and_continues() {
    let server = RecordingServer::start().await;
    let (transport, mut bus) = Transport::new(common::config(server.url()))
        .expect("Failed to create transport");

    server.respond_with(StatusCode::SERVICE_UNAVAILABLE);
    transport.send_span(&json!({ "name": "lost" }));
    transport
        .flush(FlushOptions::default())
        .await
        .expect("Failed to flush");
    let Some(TransportEvent::RequestError(err)) = bus.rx.try_recv().ok() else {
        panic!("expected a request error");
    };
    assert_eq!(err.code, Some(503));
    assert_eq!(err.message, "Unexpected APM Server response");

    server.respond_with(StatusCode::ACCEPTED);
    transport.send_span(&json!({ "name": "delivered" }));
    transport
        .flush(FlushOptions::default())
        .await
        .expect("Failed to flush");

    let requests = server.intake_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].events()[1]["span"]["name"], "delivered");
    assert_eq!(transport.sent(), 1);
    transport.end().await;
}

#[tokio::test]
#[serial]
async fn test_unreachable_server_reports_error_without_code() {
    // nothing listens on port 1
    let (transport, mut bus) = Transport::new(common::config("http://127.0.0.1:1".to_string()))
        .expect("Failed to create transport");

    transport.send_span(&json!({ "name": "s" }));
    transport
        .flush(FlushOptions::default())
        .await
        .expect("Failed to flush");

    let Some(TransportEvent::RequestError(err)) = bus.rx.try_recv().ok() else {
        panic!("expected a request error");
    };
    assert_eq!(err.code, None);
    transport.destroy();
}

#[tokio::test]
#[serial]
async fn test_end_uploads_buffered_records() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(Config {
        buffer_window_time: 60_000,
        ..common::config(server.url())
    })
    .expect("Failed to create transport");

    for i in 0..5 {
        transport
            .send_accepted(EventKind::Metricset, &json!({ "samples": { "n": { "value": i } } }))
            .await;
    }
    transport.end().await;

    let requests = server.intake_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].events().len(), 6);
    assert_eq!(transport.sent(), 5);
}
