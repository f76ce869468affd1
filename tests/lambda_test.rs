use std::time::Duration;

use apm_transport::{Config, FlushOptions, Transport};
use serde_json::json;
use serial_test::serial;

mod common;

use common::RecordingServer;

const LAMBDA_END: FlushOptions = FlushOptions { lambda_end: true };

fn lambda_config(server: &RecordingServer) -> Config {
    Config {
        aws_lambda_function_name: Some("my-fn".to_string()),
        ..common::config(server.url())
    }
}

#[tokio::test]
#[serial]
async fn test_lambda_defaults() {
    let server = RecordingServer::start().await;
    let config = lambda_config(&server);
    assert!(config.expects_extra_metadata());
    assert!(!config.central_config_enabled());

    let (transport, _bus) = Transport::new(config).expect("Failed to create transport");
    assert!(transport.lambda_should_register_transactions());
    transport.destroy();
}

#[tokio::test]
#[serial]
async fn test_lambda_invocations() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(Config {
        buffer_window_size: 2,
        ..lambda_config(&server)
    })
    .expect("Failed to create transport");
    transport.set_extra_metadata(json!({ "service": { "runtime": { "name": "AWS_Lambda_rust" } } }));

    // corked before the invocation starts, whatever the window settings
    for name in ["a", "b", "c"] {
        transport.send_span(&json!({ "name": name }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.requests().is_empty());

    transport.lambda_start();
    transport
        .lambda_register_transaction(
            &json!({ "name": "GET /aStage/myFn", "type": "lambda" }),
            "063de0d2-1705-4eeb-9dfd-045d76b8cdec",
        )
        .await;
    assert!(transport.lambda_should_register_transactions());

    let requests = server.requests();
    let register = &requests[0];
    assert_eq!(register.path, "/register/transaction");
    assert_eq!(
        register.header("content-type"),
        Some("application/vnd.elastic.apm.transaction+ndjson")
    );
    assert_eq!(
        register.header("x-elastic-aws-request-id"),
        Some("063de0d2-1705-4eeb-9dfd-045d76b8cdec")
    );
    let registered = register.events();
    assert_eq!(
        registered[0]["metadata"]["service"]["runtime"]["name"],
        "AWS_Lambda_rust"
    );
    assert_eq!(registered[1]["transaction"]["name"], "GET /aStage/myFn");

    transport.send_transaction(&json!({ "name": "GET /aStage/myFn", "type": "lambda" }));
    transport.flush(LAMBDA_END).await.expect("Failed to flush");

    let intake = server.intake_requests();
    let last = intake.last().expect("no intake request");
    assert_eq!(last.query.as_deref(), Some("flushed=true"));
    let names: Vec<_> = intake
        .iter()
        .flat_map(|request| request.events())
        .filter_map(|event| {
            event
                .get("span")
                .or_else(|| event.get("transaction"))
                .map(|record| record["name"].clone())
        })
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "GET /aStage/myFn"]);

    // sent after the end of the invocation: held until the next one
    transport.send_span(&json!({ "name": "late" }));
    let late_flush = {
        let (tx, rx) = tokio::sync::oneshot::channel();
        transport.flush_with(FlushOptions::default(), move |result| {
            let _ = tx.send(result);
        });
        rx
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.intake_requests().len(), intake.len());

    transport.lambda_start();
    transport.flush(LAMBDA_END).await.expect("Failed to flush");
    assert_eq!(late_flush.await.expect("flush callback dropped"), Ok(()));

    let intake = server.intake_requests();
    let last = intake.last().expect("no intake request");
    assert_eq!(last.query.as_deref(), Some("flushed=true"));
    assert_eq!(last.events()[1]["span"]["name"], "late");
    transport.end().await;
}

#[tokio::test]
#[serial]
async fn test_lambda_end_without_records_sends_metadata() {
    let server = RecordingServer::start().await;
    let (transport, _bus) = Transport::new(lambda_config(&server)).expect("Failed to create transport");
    transport.set_extra_metadata(json!({}));
    transport.lambda_start();
    transport.flush(LAMBDA_END).await.expect("Failed to flush");

    let intake = server.intake_requests();
    assert_eq!(intake.len(), 1);
    assert_eq!(intake[0].query.as_deref(), Some("flushed=true"));
    let events = intake[0].events();
    assert_eq!(events.len(), 1);
    assert!(events[0].get("metadata").is_some());
    transport.end().await;
}
