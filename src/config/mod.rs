pub mod cloud_provider;
pub mod key_value;
pub mod log_level;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_bool_from_anything;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{
    cloud_provider::CloudProvider,
    key_value::{deserialize_key_value_pairs, deserialize_labels},
    log_level::LogLevel,
};

pub const CONFIG_FILE_NAME: &str = "elastic-apm.yaml";
pub const ENV_PREFIX: &str = "ELASTIC_APM_";

lazy_static! {
    // Characters allowed in the comment part of a User-Agent header.
    static ref USER_AGENT_COMMENT_RE: Regex =
        Regex::new(r"[^\t \x21-\x27\x2a-\x5b\x5d-\x7e\x80-\xff]").expect("failed creating regex");
}

#[derive(Debug, PartialEq, Deserialize, Clone)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub service_node_name: Option<String>,
    pub environment: String,
    pub framework_name: Option<String>,
    pub framework_version: Option<String>,
    pub runtime_name: Option<String>,
    pub runtime_version: Option<String>,
    pub language_name: String,
    /// Overrides the detected hostname in `system.configured_hostname`.
    pub hostname: Option<String>,
    #[serde(deserialize_with = "deserialize_labels")]
    pub global_labels: Map<String, Value>,

    pub agent_name: Option<String>,
    pub agent_version: Option<String>,
    pub agent_activation_method: Option<String>,

    pub server_url: String,
    pub secret_token: Option<String>,
    pub api_key: Option<String>,
    /// Extra headers sent with every request to the APM Server.
    #[serde(deserialize_with = "deserialize_key_value_pairs")]
    pub headers: HashMap<String, String>,
    #[serde(deserialize_with = "deserialize_bool_from_anything")]
    pub verify_server_cert: bool,
    pub server_ca_cert_file: Option<String>,
    pub https_proxy: Option<String>,
    /// Connect and central config request timeout in seconds
    pub server_timeout: u64,
    #[serde(deserialize_with = "deserialize_bool_from_anything")]
    pub central_config: bool,
    /// Skips the version probe when set.
    pub apm_server_version: Option<String>,

    pub buffer_window_size: usize,
    /// Milliseconds
    pub buffer_window_time: u64,
    pub max_queue_size: usize,
    /// Uncompressed bytes per intake request
    pub api_request_size: usize,
    /// Milliseconds
    pub intake_response_timeout: u64,
    /// Milliseconds, used when the transport is ending
    pub intake_response_timeout_on_end: u64,
    /// Milliseconds a flush waits for in-flight events
    pub inflight_timeout: u64,

    pub keyword_max_length: usize,
    pub long_field_max_length: usize,
    pub string_max_length: usize,
    pub error_message_max_length: Option<i64>,
    pub custom_key_max_length: usize,

    pub cloud_provider: CloudProvider,
    #[serde(deserialize_with = "deserialize_bool_from_anything")]
    pub expect_extra_metadata: bool,
    pub container_id: Option<String>,
    pub kubernetes_node_name: Option<String>,
    pub kubernetes_namespace: Option<String>,
    pub kubernetes_pod_name: Option<String>,
    pub kubernetes_pod_uid: Option<String>,
    pub aws_lambda_function_name: Option<String>,

    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_name: None,
            service_version: None,
            service_node_name: None,
            environment: "development".to_string(),
            framework_name: None,
            framework_version: None,
            runtime_name: None,
            runtime_version: None,
            language_name: "rust".to_string(),
            hostname: None,
            global_labels: Map::new(),

            agent_name: None,
            agent_version: None,
            agent_activation_method: None,

            server_url: "http://127.0.0.1:8200".to_string(),
            secret_token: None,
            api_key: None,
            headers: HashMap::new(),
            verify_server_cert: true,
            server_ca_cert_file: None,
            https_proxy: None,
            server_timeout: 30,
            central_config: true,
            apm_server_version: None,

            buffer_window_size: 50,
            buffer_window_time: 20,
            max_queue_size: 1024,
            api_request_size: 768 * 1024,
            intake_response_timeout: 10_000,
            intake_response_timeout_on_end: 1_000,
            inflight_timeout: 1_000,

            keyword_max_length: 1024,
            long_field_max_length: 10_000,
            string_max_length: 1024,
            error_message_max_length: None,
            custom_key_max_length: 1024,

            cloud_provider: CloudProvider::Auto,
            expect_extra_metadata: false,
            container_id: None,
            kubernetes_node_name: None,
            kubernetes_namespace: None,
            kubernetes_pod_name: None,
            kubernetes_pod_uid: None,
            aws_lambda_function_name: None,

            log_level: LogLevel::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    ParseError(String),
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid server_url '{0}'")]
    InvalidServerUrl(String),
}

impl Config {
    /// Checks the fields the transport cannot work without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("service_name", &self.service_name),
            ("agent_name", &self.agent_name),
            ("agent_version", &self.agent_version),
        ];
        for (field, value) in required {
            if value.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::MissingField(field));
            }
        }
        self.server_url()?;
        Ok(())
    }

    pub fn server_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.server_url)
            .map_err(|_| ConfigError::InvalidServerUrl(self.server_url.clone()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::InvalidServerUrl(self.server_url.clone()));
        }
        Ok(url)
    }

    /// Resolves an API path against `server_url`, keeping any path prefix.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        let base = self.server_url()?;
        let joined = format!("{}{path}", base.as_str().trim_end_matches('/'));
        Url::parse(&joined).map_err(|_| ConfigError::InvalidServerUrl(joined))
    }

    #[must_use]
    pub fn is_lambda(&self) -> bool {
        self.aws_lambda_function_name
            .as_deref()
            .is_some_and(|name| !name.is_empty())
    }

    /// Whether uploads must wait for the host platform to supply metadata.
    #[must_use]
    pub fn expects_extra_metadata(&self) -> bool {
        self.expect_extra_metadata || self.is_lambda()
    }

    #[must_use]
    pub fn central_config_enabled(&self) -> bool {
        self.central_config && !self.is_lambda()
    }

    #[must_use]
    pub fn effective_cloud_provider(&self) -> CloudProvider {
        if self.is_lambda() {
            CloudProvider::None
        } else {
            self.cloud_provider
        }
    }

    /// `apm-agent-<name>/<version> (<service name> <service version>)`
    #[must_use]
    pub fn user_agent(&self) -> String {
        let base = format!(
            "apm-agent-{}/{}",
            self.agent_name.as_deref().unwrap_or("unknown"),
            self.agent_version.as_deref().unwrap_or("unknown")
        );
        let comment = [&self.service_name, &self.service_version]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if comment.is_empty() {
            base
        } else {
            format!("{base} ({})", USER_AGENT_COMMENT_RE.replace_all(&comment, "_"))
        }
    }

    #[must_use]
    pub fn buffer_window_time(&self) -> Duration {
        Duration::from_millis(self.buffer_window_time)
    }

    #[must_use]
    pub fn intake_response_timeout(&self) -> Duration {
        Duration::from_millis(self.intake_response_timeout)
    }

    #[must_use]
    pub fn intake_response_timeout_on_end(&self) -> Duration {
        Duration::from_millis(self.intake_response_timeout_on_end)
    }

    #[must_use]
    pub fn inflight_timeout(&self) -> Duration {
        Duration::from_millis(self.inflight_timeout)
    }

    #[must_use]
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout)
    }
}

/// Loads the configuration from `elastic-apm.yaml` in `config_directory`
/// overlaid with `ELASTIC_APM_*` environment variables.
#[allow(clippy::module_name_repetitions)]
pub fn get_config(config_directory: &Path) -> Result<Config, ConfigError> {
    let path = config_directory.join(CONFIG_FILE_NAME);

    let figment = Figment::new()
        .merge(Yaml::file(&path))
        .merge(Env::raw().only(&[
            "AWS_LAMBDA_FUNCTION_NAME",
            "HTTPS_PROXY",
            "KUBERNETES_NAMESPACE",
            "KUBERNETES_NODE_NAME",
            "KUBERNETES_POD_NAME",
            "KUBERNETES_POD_UID",
        ]))
        .merge(Env::prefixed(ENV_PREFIX));

    let config: Config = figment.extract().map_err(|err| {
        tracing::error!("Failed to parse APM agent config: {err}");
        ConfigError::ParseError(err.to_string())
    })?;
    config.validate()?;
    Ok(config)
}
