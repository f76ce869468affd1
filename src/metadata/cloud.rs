//! Cloud provider metadata services.
//!
//! Every fetcher maps its provider's instance document to the intake
//! `metadata.cloud` shape. Failures are expected off-cloud and only logged.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_ok;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::config::cloud_provider::CloudProvider;

pub const CLOUD_METADATA_TIMEOUT: Duration = Duration::from_secs(3);

const AWS_BASE_URL: &str = "http://169.254.169.254";
const AWS_TOKEN_PATH: &str = "/latest/api/token";
const AWS_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";
const AWS_TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const AWS_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

const GCP_BASE_URL: &str = "http://metadata.google.internal";
const GCP_METADATA_PATH: &str = "/computeMetadata/v1/?recursive=true";

const AZURE_BASE_URL: &str = "http://169.254.169.254";
const AZURE_METADATA_PATH: &str = "/metadata/instance?api-version=2020-09-01";

#[derive(Debug, Error)]
pub enum CloudMetadataError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code {0}")]
    Status(u16),
    #[error("unexpected response: {0}")]
    Format(String),
    #[error("no cloud metadata service responded")]
    NoProvider,
}

#[async_trait]
pub trait CloudMetadataFetcher: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn fetch(&self) -> Result<Value, CloudMetadataError>;
}

fn metadata_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(CLOUD_METADATA_TIMEOUT)
        .no_proxy()
        .build()
        .unwrap_or_default()
}

async fn get_json(request: reqwest::RequestBuilder) -> Result<Value, CloudMetadataError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CloudMetadataError::Status(status.as_u16()));
    }
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| CloudMetadataError::Format(e.to_string()))
}

fn str_field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn id_field(value: &Value, path: &[&str]) -> Option<String> {
    let field = path.iter().try_fold(value, |current, key| current.get(*key))?;
    match field {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn insert_str(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Maps an EC2 instance identity document.
pub fn format_aws(document: &Value) -> Result<Value, CloudMetadataError> {
    let instance_id = str_field(document, &["instanceId"])
        .ok_or_else(|| CloudMetadataError::Format("missing instanceId".to_string()))?;

    let mut cloud = Map::new();
    cloud.insert("provider".to_string(), json!("aws"));
    cloud.insert("instance".to_string(), json!({ "id": instance_id }));
    if let Some(account) = str_field(document, &["accountId"]) {
        cloud.insert("account".to_string(), json!({ "id": account }));
    }
    if let Some(machine) = str_field(document, &["instanceType"]) {
        cloud.insert("machine".to_string(), json!({ "type": machine }));
    }
    insert_str(
        &mut cloud,
        "availability_zone",
        str_field(document, &["availabilityZone"]),
    );
    insert_str(&mut cloud, "region", str_field(document, &["region"]));
    Ok(Value::Object(cloud))
}

/// Maps the recursive GCE metadata tree.
pub fn format_gcp(document: &Value) -> Result<Value, CloudMetadataError> {
    let instance_id = id_field(document, &["instance", "id"])
        .ok_or_else(|| CloudMetadataError::Format("missing instance.id".to_string()))?;

    let mut cloud = Map::new();
    cloud.insert("provider".to_string(), json!("gcp"));

    let mut instance = Map::new();
    instance.insert("id".to_string(), Value::String(instance_id));
    insert_str(&mut instance, "name", str_field(document, &["instance", "name"]));
    cloud.insert("instance".to_string(), Value::Object(instance));

    let mut project = Map::new();
    if let Some(id) = id_field(document, &["project", "numericProjectId"]) {
        project.insert("id".to_string(), Value::String(id));
    }
    insert_str(&mut project, "name", str_field(document, &["project", "projectId"]));
    if !project.is_empty() {
        cloud.insert("project".to_string(), Value::Object(project));
    }

    // "projects/513326162531/zones/us-west1-b"
    if let Some(zone) = str_field(document, &["instance", "zone"]).map(last_segment) {
        cloud.insert("availability_zone".to_string(), json!(zone));
        if let Some((region, _)) = zone.rsplit_once('-') {
            cloud.insert("region".to_string(), json!(region));
        }
    }
    if let Some(machine) = str_field(document, &["instance", "machineType"]).map(last_segment) {
        cloud.insert("machine".to_string(), json!({ "type": machine }));
    }
    Ok(Value::Object(cloud))
}

/// Maps the Azure instance metadata service document.
pub fn format_azure(document: &Value) -> Result<Value, CloudMetadataError> {
    let compute = document
        .get("compute")
        .ok_or_else(|| CloudMetadataError::Format("missing compute".to_string()))?;

    let mut cloud = Map::new();
    cloud.insert("provider".to_string(), json!("azure"));
    if let Some(subscription) = str_field(compute, &["subscriptionId"]) {
        cloud.insert("account".to_string(), json!({ "id": subscription }));
    }
    let mut instance = Map::new();
    insert_str(&mut instance, "id", str_field(compute, &["vmId"]));
    insert_str(&mut instance, "name", str_field(compute, &["name"]));
    if !instance.is_empty() {
        cloud.insert("instance".to_string(), Value::Object(instance));
    }
    if let Some(group) = str_field(compute, &["resourceGroupName"]) {
        cloud.insert("project".to_string(), json!({ "name": group }));
    }
    insert_str(&mut cloud, "availability_zone", str_field(compute, &["zone"]));
    if let Some(size) = str_field(compute, &["vmSize"]) {
        cloud.insert("machine".to_string(), json!({ "type": size }));
    }
    insert_str(&mut cloud, "region", str_field(compute, &["location"]));
    Ok(Value::Object(cloud))
}

pub struct AwsFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl AwsFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        AwsFetcher {
            client,
            base_url: base_url.into(),
        }
    }

    // IMDSv2, instances that only allow v1 answer the document without a token.
    async fn token(&self) -> Option<String> {
        let response = self
            .client
            .put(format!("{}{AWS_TOKEN_PATH}", self.base_url))
            .header(AWS_TOKEN_TTL_HEADER, "300")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}

#[async_trait]
impl CloudMetadataFetcher for AwsFetcher {
    fn provider(&self) -> &'static str {
        CloudProvider::Aws.as_str()
    }

    async fn fetch(&self) -> Result<Value, CloudMetadataError> {
        let mut request = self
            .client
            .get(format!("{}{AWS_DOCUMENT_PATH}", self.base_url));
        if let Some(token) = self.token().await {
            request = request.header(AWS_TOKEN_HEADER, token);
        }
        format_aws(&get_json(request).await?)
    }
}

pub struct GcpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl GcpFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        GcpFetcher {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CloudMetadataFetcher for GcpFetcher {
    fn provider(&self) -> &'static str {
        CloudProvider::Gcp.as_str()
    }

    async fn fetch(&self) -> Result<Value, CloudMetadataError> {
        let request = self
            .client
            .get(format!("{}{GCP_METADATA_PATH}", self.base_url))
            .header("Metadata-Flavor", "Google");
        format_gcp(&get_json(request).await?)
    }
}

pub struct AzureFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl AzureFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        AzureFetcher {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CloudMetadataFetcher for AzureFetcher {
    fn provider(&self) -> &'static str {
        CloudProvider::Azure.as_str()
    }

    async fn fetch(&self) -> Result<Value, CloudMetadataError> {
        let request = self
            .client
            .get(format!("{}{AZURE_METADATA_PATH}", self.base_url))
            .header("Metadata", "true");
        format_azure(&get_json(request).await?)
    }
}

/// Queries several providers at once, the first successful answer wins.
pub struct AutoFetcher {
    fetchers: Vec<Box<dyn CloudMetadataFetcher>>,
}

impl AutoFetcher {
    #[must_use]
    pub fn new(fetchers: Vec<Box<dyn CloudMetadataFetcher>>) -> Self {
        AutoFetcher { fetchers }
    }
}

#[async_trait]
impl CloudMetadataFetcher for AutoFetcher {
    fn provider(&self) -> &'static str {
        CloudProvider::Auto.as_str()
    }

    async fn fetch(&self) -> Result<Value, CloudMetadataError> {
        if self.fetchers.is_empty() {
            return Err(CloudMetadataError::NoProvider);
        }
        let attempts = self.fetchers.iter().map(|fetcher| fetcher.fetch());
        match select_ok(attempts).await {
            Ok((cloud, _pending)) => Ok(cloud),
            Err(_) => Err(CloudMetadataError::NoProvider),
        }
    }
}

/// The fetcher for a configured provider, `None` when collection is off.
#[must_use]
pub fn fetcher_for(provider: CloudProvider) -> Option<Box<dyn CloudMetadataFetcher>> {
    let client = metadata_client();
    match provider {
        CloudProvider::None => None,
        CloudProvider::Aws => Some(Box::new(AwsFetcher::new(client, AWS_BASE_URL))),
        CloudProvider::Gcp => Some(Box::new(GcpFetcher::new(client, GCP_BASE_URL))),
        CloudProvider::Azure => Some(Box::new(AzureFetcher::new(client, AZURE_BASE_URL))),
        CloudProvider::Auto => Some(Box::new(AutoFetcher::new(vec![
            Box::new(AwsFetcher::new(client.clone(), AWS_BASE_URL)),
            Box::new(GcpFetcher::new(client.clone(), GCP_BASE_URL)),
            Box::new(AzureFetcher::new(client, AZURE_BASE_URL)),
        ]))),
    }
}
