//! Polling of agent configuration managed in Kibana.
//!
//! The poller issues conditional GETs against `/config/v1/agents`, honours the
//! `Cache-Control: max-age` the server negotiates and falls back to
//! [`Backoff`] delays while the server misbehaves.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{
    StatusCode,
    header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, HeaderMap, IF_NONE_MATCH},
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    backoff::Backoff,
    config::Config,
    event_bus::{EventSender, TransportEvent},
    http::base_headers,
    intake::RequestError,
};

pub const CENTRAL_CONFIG_PATH: &str = "/config/v1/agents";
pub const POLL_ERROR_MESSAGE: &str = "Unexpected APM Server response when polling config";

/// Interval used when the server does not negotiate one, in seconds.
pub const INTERVAL_DEFAULT_S: u64 = 300;
pub const INTERVAL_MIN_S: u64 = 5;
pub const INTERVAL_MAX_S: u64 = 86_400;

lazy_static! {
    static ref MAX_AGE_RE: Regex =
        Regex::new(r"max-age\s*=\s*([^,\s]*)").expect("failed creating regex");
}

/// Maps a `max-age` directive to the next poll interval in seconds.
///
/// `0`, missing, negative and unparsable values all mean the server default.
#[must_use]
pub fn get_interval_s(max_age: Option<&str>) -> u64 {
    let Some(seconds) = max_age.and_then(|raw| raw.trim().parse::<f64>().ok()) else {
        return INTERVAL_DEFAULT_S;
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return INTERVAL_DEFAULT_S;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let seconds = seconds.floor() as u64;
    if seconds == 0 {
        INTERVAL_DEFAULT_S
    } else {
        seconds.clamp(INTERVAL_MIN_S, INTERVAL_MAX_S)
    }
}

/// Extracts the raw `max-age` value from a `Cache-Control` header.
#[must_use]
pub fn parse_max_age(cache_control: &str) -> Option<&str> {
    MAX_AGE_RE
        .captures(cache_control)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CentralConfigCache {
    pub etag: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Changed(Value),
    Unchanged,
    Failed(RequestError),
}

pub struct CentralConfigPoller {
    client: reqwest::Client,
    config: Config,
    events: EventSender,
    cache: CentralConfigCache,
    backoff: Backoff,
    interval: Duration,
}

impl CentralConfigPoller {
    #[must_use]
    pub fn new(client: reqwest::Client, config: Config, events: EventSender) -> Self {
        CentralConfigPoller {
            client,
            config,
            events,
            cache: CentralConfigCache::default(),
            backoff: Backoff::new(),
            interval: Duration::from_secs(INTERVAL_DEFAULT_S),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &CentralConfigCache {
        &self.cache
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = base_headers(&self.config);
        if let Some(etag) = self.cache.etag.as_deref().and_then(|e| e.parse().ok()) {
            headers.insert(IF_NONE_MATCH, etag);
        }
        headers
    }

    async fn fetch(&mut self) -> PollOutcome {
        let url = match self.config.endpoint(CENTRAL_CONFIG_PATH) {
            Ok(url) => url,
            Err(e) => return PollOutcome::Failed(RequestError::new(e.to_string())),
        };
        let mut query = vec![("service.name", self.config.service_name.clone().unwrap_or_default())];
        if !self.config.environment.is_empty() {
            query.push(("service.environment", self.config.environment.clone()));
        }

        let response = match self
            .client
            .get(url)
            .query(&query)
            .headers(self.request_headers())
            .timeout(self.config.server_timeout())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return PollOutcome::Failed(RequestError::network(POLL_ERROR_MESSAGE, &e)),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return PollOutcome::Unchanged;
        }

        let headers = response.headers().clone();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return PollOutcome::Failed(RequestError::network(POLL_ERROR_MESSAGE, &e)),
        };

        if status != StatusCode::OK {
            return PollOutcome::Failed(poll_error(status.as_u16(), &headers, &body));
        }
        let Ok(parsed) = serde_json::from_str::<Value>(&body) else {
            return PollOutcome::Failed(poll_error(status.as_u16(), &headers, &body));
        };

        self.cache.etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.cache.last_fetched_at = Some(Utc::now());
        let max_age = headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age);
        self.interval = Duration::from_secs(get_interval_s(max_age));
        PollOutcome::Changed(parsed)
    }

    /// Runs one poll cycle, reports its outcome on the event bus and returns
    /// how long to wait before the next one.
    pub async fn poll_once(&mut self) -> (PollOutcome, Duration) {
        let outcome = self.fetch().await;
        let delay = match &outcome {
            PollOutcome::Changed(config) => {
                debug!("CENTRAL_CONFIG | Received new agent config, next poll in {:?}", self.interval);
                self.backoff.next_delay(false);
                self.events.emit(TransportEvent::Config(config.clone()));
                self.interval
            }
            PollOutcome::Unchanged => {
                debug!("CENTRAL_CONFIG | Agent config unchanged");
                self.backoff.next_delay(false);
                self.interval
            }
            PollOutcome::Failed(err) => {
                let delay = self.backoff.next_delay(true);
                warn!(
                    "CENTRAL_CONFIG | {} (code: {:?}), retrying in {:?}",
                    err.message, err.code, delay
                );
                self.events.request_error(err.clone());
                delay
            }
        };
        (outcome, delay)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let (_, delay) = tokio::select! {
                () = cancel.cancelled() => break,
                polled = self.poll_once() => polled,
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        debug!("CENTRAL_CONFIG | Poller stopped");
    }
}

fn poll_error(status: u16, headers: &HeaderMap, body: &str) -> RequestError {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    let parsed = if is_json {
        serde_json::from_str::<Value>(body).ok()
    } else {
        None
    };
    let response = match parsed {
        Some(Value::String(message)) => Some(message),
        Some(Value::Object(map)) => match map.get("error") {
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
            None => Some(body.to_string()),
        },
        _ => (!body.is_empty()).then(|| body.to_string()),
    };
    RequestError {
        code: Some(status),
        response,
        ..RequestError::new(POLL_ERROR_MESSAGE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::{config::tests::test_config, event_bus::EventBus};

    #[test]
    fn test_interval_mapping() {
        let cases = [
            (Some("0"), 300),
            (Some("1"), 5),
            (Some("5"), 5),
            (Some("6"), 6),
            (Some("3600"), 3600),
            (Some("86400"), 86_400),
            (Some("86401"), 86_400),
            (Some("-1"), 300),
            (Some("NaN"), 300),
            (Some("foo"), 300),
            (Some(""), 300),
            (None, 300),
        ];
        for (max_age, expected) in cases {
            assert_eq!(get_interval_s(max_age), expected, "max-age {max_age:?}");
        }
    }

    #[test]
    fn test_parse_max_age() {
        assert_eq!(parse_max_age("max-age=30, must-revalidate"), Some("30"));
        assert_eq!(parse_max_age("private, max-age = -5"), Some("-5"));
        assert_eq!(parse_max_age("no-cache"), None);
    }

    fn without_etag(req: &HttpMockRequest) -> bool {
        req.headers.as_ref().is_none_or(|headers| {
            headers
                .iter()
                .all(|(name, _)| !name.eq_ignore_ascii_case("if-none-match"))
        })
    }

        fn poller(server: &MockServer) -> (CentralConfigPoller, EventBus) {
        let (bus, sender) = EventBus::run();
        let config = Config {
            server_url: server.base_url(),
            central_config: true,
            ..test_config()
        };
        (
            CentralConfigPoller::new(reqwest::Client::new(), config, sender),
            bus,
        )
    }

    #[tokio::test]
    async fn test_conditional_get_with_etag() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(CENTRAL_CONFIG_PATH)
                    .query_param("service.name", "my-service")
                    .query_param("service.environment", "development")
                    .header("user-agent", "apm-agent-rust/1.2.3 (my-service)")
                    .matches(without_etag);
                then.status(200)
                    .header("etag", "\"42\"")
                    .header("cache-control", "max-age=30, must-revalidate")
                    .json_body(json!({ "transaction_sample_rate": "0.3" }));
            })
            .await;
        let (mut poller, mut bus) = poller(&server);

        let (outcome, delay) = poller.poll_once().await;
        first.assert_async().await;
        assert_eq!(
            outcome,
            PollOutcome::Changed(json!({ "transaction_sample_rate": "0.3" }))
        );
        assert_eq!(delay, Duration::from_secs(30));
        assert_eq!(poller.cache().etag.as_deref(), Some("\"42\""));
        assert!(poller.cache().last_fetched_at.is_some());
        assert_eq!(
            bus.rx.try_recv().unwrap(),
            TransportEvent::Config(json!({ "transaction_sample_rate": "0.3" }))
        );

        first.delete_async().await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(CENTRAL_CONFIG_PATH)
                    .header("if-none-match", "\"42\"");
                then.status(304).header("cache-control", "max-age=1");
            })
            .await;
        let (outcome, delay) = poller.poll_once().await;
        second.assert_async().await;
        assert_eq!(outcome, PollOutcome::Unchanged);
        // a 304 keeps the previously negotiated interval
        assert_eq!(delay, Duration::from_secs(30));
        assert!(bus.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_response_uses_backoff_not_max_age() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(CENTRAL_CONFIG_PATH)
                    .matches(without_etag);
                then.status(500)
                    .header("cache-control", "max-age=1")
                    .body("{\"invalid JSON\"}");
            })
            .await;
        let (mut poller, mut bus) = poller(&server);

        let (outcome, delay) = poller.poll_once().await;
        assert_eq!(delay, Duration::ZERO);
        let PollOutcome::Failed(err) = outcome else {
            panic!("expected a failed poll");
        };
        assert_eq!(err.code, Some(500));
        assert_eq!(err.message, POLL_ERROR_MESSAGE);
        assert_eq!(err.response.as_deref(), Some("{\"invalid JSON\"}"));
        assert!(matches!(
            bus.rx.try_recv().unwrap(),
            TransportEvent::RequestError(_)
        ));

        let (_, delay) = poller.poll_once().await;
        assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
        failing.assert_hits_async(2).await;
        assert_eq!(poller.cache().etag, None);
    }

    #[tokio::test]
    async fn test_error_body_shapes() {
        let server = MockServer::start_async().await;
        let mut mock = server
            .mock_async(|when, then| {
                when.method(GET).path(CENTRAL_CONFIG_PATH);
                then.status(404)
                    .header("content-type", "application/json")
                    .json_body(json!({ "error": "agent config not found" }));
            })
            .await;
        let (mut poller, _bus) = poller(&server);
        let (outcome, _) = poller.poll_once().await;
        let PollOutcome::Failed(err) = outcome else {
            panic!("expected a failed poll");
        };
        assert_eq!(err.response.as_deref(), Some("agent config not found"));

        mock.delete_async().await;
        mock = server
            .mock_async(|when, then| {
                when.method(GET).path(CENTRAL_CONFIG_PATH);
                then.status(503)
                    .header("content-type", "application/json")
                    .body("\"server is starting\"");
            })
            .await;
        let (outcome, _) = poller.poll_once().await;
        let PollOutcome::Failed(err) = outcome else {
            panic!("expected a failed poll");
        };
        assert_eq!(err.code, Some(503));
        assert_eq!(err.response.as_deref(), Some("server is starting"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_json_on_200_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(CENTRAL_CONFIG_PATH);
                then.status(200).header("etag", "\"1\"").body("not json");
            })
            .await;
        let (mut poller, _bus) = poller(&server);
        let (outcome, delay) = poller.poll_once().await;
        assert!(matches!(outcome, PollOutcome::Failed(ref e) if e.code == Some(200)));
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(poller.cache().etag, None);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path(CENTRAL_CONFIG_PATH);
                then.status(200).json_body(json!({}));
            })
            .await;
        let (poller, _bus) = poller(&server);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();
        mock.assert_hits_async(1).await;
    }
}
