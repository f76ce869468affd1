//! APM Server version probe and the features gated on it.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{config::Config, http::base_headers};

pub const SERVER_INFO_PATH: &str = "/";

/// First server version that stopped accepting unsampled transactions.
const NO_UNSAMPLED_TRANSACTIONS: ServerVersion = ServerVersion::new(8, 0, 0);
/// First server version accepting `metadata.service.agent.activation_method`.
const ACTIVATION_METHOD_FIELD: ServerVersion = ServerVersion::new(8, 7, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ServerVersion {
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        ServerVersion {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ServerVersion {
    type Err = ServerVersionError;

    /// Parses `major[.minor[.patch]]`, ignoring pre-release and build suffixes
    /// such as `8.0.0-SNAPSHOT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s
            .trim()
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let mut parts = core.split('.').map(str::parse::<u64>);
        let invalid = || ServerVersionError::InvalidVersion(s.to_string());

        let major = parts.next().and_then(Result::ok).ok_or_else(invalid)?;
        let minor = parts.next().transpose().map_err(|_| invalid())?.unwrap_or(0);
        let patch = parts.next().transpose().map_err(|_| invalid())?.unwrap_or(0);
        Ok(ServerVersion::new(major, minor, patch))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerVersionError {
    #[error("{0}")]
    Request(String),
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    #[error("no version in server response")]
    MissingVersion,
    #[error("invalid version '{0}'")]
    InvalidVersion(String),
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    version: Option<String>,
    ok: Option<LegacyServerInfo>,
}

// Servers before 7.0 nest the build info under `ok`.
#[derive(Debug, Deserialize)]
struct LegacyServerInfo {
    version: Option<String>,
}

/// Extracts the version from a `GET /` response body.
pub fn parse_server_info(body: &[u8]) -> Result<ServerVersion, ServerVersionError> {
    let info: ServerInfo = serde_json::from_slice(body)
        .map_err(|e| ServerVersionError::Request(format!("invalid response body: {e}")))?;
    info.version
        .or_else(|| info.ok.and_then(|ok| ok.version))
        .ok_or(ServerVersionError::MissingVersion)?
        .parse()
}

pub async fn fetch_server_version(
    client: &reqwest::Client,
    config: &Config,
) -> Result<ServerVersion, ServerVersionError> {
    let url = config
        .endpoint(SERVER_INFO_PATH)
        .map_err(|e| ServerVersionError::Request(e.to_string()))?;
    let response = client
        .get(url)
        .headers(base_headers(config))
        .timeout(config.server_timeout())
        .send()
        .await
        .map_err(|e| ServerVersionError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ServerVersionError::UnexpectedStatus(status.as_u16()));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| ServerVersionError::Request(e.to_string()))?;
    let version = parse_server_info(&body)?;
    debug!("TRANSPORT | APM Server version is {version}");
    Ok(version)
}

/// Servers before 8.0 need unsampled transactions to compute metrics.
#[must_use]
pub fn supports_keeping_unsampled_transaction(version: Option<ServerVersion>) -> bool {
    version.is_none_or(|v| v < NO_UNSAMPLED_TRANSACTIONS)
}

#[must_use]
pub fn supports_activation_method_field(version: Option<ServerVersion>) -> bool {
    version.is_none_or(|v| v >= ACTIVATION_METHOD_FIELD)
}
