use std::error::Error;
use std::fs;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tracing::{error, warn};

use crate::config::Config;

/// Builds the client shared by intake uploads, central config polling and
/// the version probe so they reuse one keep-alive pool.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    build_client(config).unwrap_or_else(|e| {
        error!(
            "TRANSPORT | Unable to build HTTP client: {}, falling back to defaults",
            e
        );
        reqwest::Client::new()
    })
}

fn build_client(config: &Config) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .connect_timeout(config.server_timeout())
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        // Enable TCP keepalive
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if !config.verify_server_cert {
        warn!("TRANSPORT | Server certificate verification is disabled");
        client = client.danger_accept_invalid_certs(true);
    }

    if let Some(path) = &config.server_ca_cert_file {
        let pem = fs::read(path)?;
        client = client.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    // Covers ELASTIC_APM_HTTPS_PROXY and HTTPS_PROXY
    if let Some(https_uri) = &config.https_proxy {
        let proxy = reqwest::Proxy::https(https_uri.clone())?;
        Ok(client.proxy(proxy).build()?)
    } else {
        Ok(client.build()?)
    }
}

/// Headers sent with every request to the APM Server.
#[must_use]
pub fn base_headers(config: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let authorization = match (&config.secret_token, &config.api_key) {
        (Some(token), _) if !token.is_empty() => Some(format!("Bearer {token}")),
        (_, Some(key)) if !key.is_empty() => Some(format!("ApiKey {key}")),
        _ => None,
    };
    if let Some(value) = authorization.and_then(|v| HeaderValue::from_str(&v).ok()) {
        headers.insert(AUTHORIZATION, value);
    }

    match HeaderValue::from_str(&config.user_agent()) {
        Ok(value) => {
            headers.insert(USER_AGENT, value);
        }
        Err(e) => warn!("TRANSPORT | Invalid User-Agent header: {e}"),
    }

    for (name, value) in &config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("TRANSPORT | Ignoring invalid custom header '{name}'"),
        }
    }

    headers
}
