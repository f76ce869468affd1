#![allow(dead_code)]

use std::io::Read;
use std::net::SocketAddr;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU16, Ordering},
};

use apm_transport::config::{Config, cloud_provider::CloudProvider};
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
};
use flate2::read::GzDecoder;
use serde_json::Value;
use tokio::net::TcpListener;

/// A request received by the [`RecordingServer`], body already decompressed.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// The ndjson body parsed line by line.
    pub fn events(&self) -> Vec<Value> {
        String::from_utf8_lossy(&self.body)
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).expect("Failed parsing ndjson line"))
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    status: Arc<AtomicU16>,
}

/// Stand-in APM Server recording every request it receives.
pub struct RecordingServer {
    pub addr: SocketAddr,
    recorder: Recorder,
}

impl RecordingServer {
    pub async fn start() -> Self {
        let recorder = Recorder {
            requests: Arc::default(),
            status: Arc::new(AtomicU16::new(StatusCode::ACCEPTED.as_u16())),
        };
        let router = Router::new()
            .fallback(record)
            .with_state(recorder.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind recording server");
        let addr = listener.local_addr().expect("Failed to get local address");
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("Recording server failed");
        });
        RecordingServer { addr, recorder }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Status code answered from now on.
    pub fn respond_with(&self, status: StatusCode) {
        self.recorder.status.store(status.as_u16(), Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorder
            .requests
            .lock()
            .expect("lock poisoned")
            .clone()
    }

    pub fn intake_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == "/intake/v2/events")
            .collect()
    }
}

async fn record(
    State(recorder): State<Recorder>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let gzipped = headers
        .get("content-encoding")
        .is_some_and(|encoding| encoding == "gzip");
    let body = if gzipped {
        let mut decoded = Vec::new();
        GzDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .expect("Failed to gunzip request body");
        decoded
    } else {
        body.to_vec()
    };

    recorder
        .requests
        .lock()
        .expect("lock poisoned")
        .push(RecordedRequest {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            body,
        });
    StatusCode::from_u16(recorder.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::ACCEPTED)
}

/// A configuration talking to `server_url` with every background task off.
pub fn config(server_url: String) -> Config {
    Config {
        service_name: Some("my-service".to_string()),
        service_version: Some("1.0.0".to_string()),
        agent_name: Some("rust".to_string()),
        agent_version: Some("1.2.3".to_string()),
        server_url,
        central_config: false,
        cloud_provider: CloudProvider::None,
        apm_server_version: Some("8.8.0".to_string()),
        ..Config::default()
    }
}
