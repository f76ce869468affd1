use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Which cloud metadata service to query for `metadata.cloud`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CloudProvider {
    /// Query every supported provider and keep the first answer.
    #[default]
    Auto,
    Aws,
    Gcp,
    Azure,
    None,
}

impl CloudProvider {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloudProvider::Auto => "auto",
            CloudProvider::Aws => "aws",
            CloudProvider::Gcp => "gcp",
            CloudProvider::Azure => "azure",
            CloudProvider::None => "none",
        }
    }
}

// "auto", "aws", "gcp", "azure" or "none", anything else is "auto"
impl<'de> Deserialize<'de> for CloudProvider {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.trim().to_lowercase().as_str() {
            "auto" => Ok(CloudProvider::Auto),
            "aws" => Ok(CloudProvider::Aws),
            "gcp" => Ok(CloudProvider::Gcp),
            "azure" => Ok(CloudProvider::Azure),
            "none" => Ok(CloudProvider::None),
            _ => {
                debug!("Invalid cloud provider: {}, using auto", value);
                Ok(CloudProvider::Auto)
            }
        }
    }
}
