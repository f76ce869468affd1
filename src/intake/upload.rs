use std::time::Duration;

use bytes::Bytes;
use reqwest::{
    StatusCode, Url,
    header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap},
};
use tracing::debug;

use crate::intake::RequestError;

pub const INTAKE_PATH: &str = "/intake/v2/events";
pub const REGISTER_TRANSACTION_PATH: &str = "/register/transaction";

const NDJSON: &str = "application/x-ndjson";
const REGISTER_TRANSACTION_CONTENT_TYPE: &str = "application/vnd.elastic.apm.transaction+ndjson";
const AWS_REQUEST_ID_HEADER: &str = "x-elastic-aws-request-id";

/// Appends the marker the Lambda extension uses to detect the last request
/// of an invocation.
pub fn mark_flushed(url: &mut Url) {
    url.query_pairs_mut().append_pair("flushed", "true");
}

async fn into_result(response: reqwest::Response) -> Result<(), RequestError> {
    let status = response.status();
    if status.is_success() {
        // drain the body so the connection goes back to the pool
        let _ = response.bytes().await;
        return Ok(());
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    Err(RequestError::from_intake_response(
        status.as_u16(),
        content_type.as_deref(),
        &body,
    ))
}

/// Sends one gzip compressed ndjson body to the intake endpoint.
pub async fn send_events(
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<(), RequestError> {
    debug!("INTAKE | Sending {} bytes to {}", body.len(), url);
    let response = client
        .post(url)
        .headers(headers)
        .header(CONTENT_TYPE, NDJSON)
        .header(CONTENT_ENCODING, "gzip")
        .header(ACCEPT, "application/json")
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .map_err(|e| RequestError::network("Unable to send events to APM Server", &e))?;
    into_result(response).await
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    Registered,
    /// The extension does not know the endpoint, stop registering.
    NotSupported,
    Failed(RequestError),
}

/// Announces a Lambda transaction to the extension before it ends, so the
/// extension can report it should the function time out.
pub async fn register_transaction(
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    aws_request_id: String,
    timeout: Duration,
) -> RegisterOutcome {
    let response = client
        .post(url)
        .headers(headers)
        .header(CONTENT_TYPE, REGISTER_TRANSACTION_CONTENT_TYPE)
        .header(AWS_REQUEST_ID_HEADER, aws_request_id)
        .timeout(timeout)
        .body(body)
        .send()
        .await;

    match response {
        Ok(response) if response.status() == StatusCode::NOT_FOUND => {
            RegisterOutcome::NotSupported
        }
        Ok(response) => match into_result(response).await {
            Ok(()) => RegisterOutcome::Registered,
            Err(err) => RegisterOutcome::Failed(err),
        },
        Err(e) => RegisterOutcome::Failed(RequestError::network(
            "Unable to register transaction",
            &e,
        )),
    }
}
