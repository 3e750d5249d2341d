use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelRegistryType {
    #[serde(rename = "huggingface")]
    HuggingFace,
    #[serde(rename = "bentoml")]
    BentoMl,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRegistrySpec {
    #[serde(rename = "type")]
    pub registry_type: ModelRegistryType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRegistry {
    pub metadata: Metadata,
    pub spec: ModelRegistrySpec,
}

impl ModelRegistry {
    pub fn key(&self) -> String {
        self.metadata.key()
    }

    /// `nfs://server/export/path` → `server:/export/path`.
    pub fn nfs_source(&self) -> Option<String> {
        let rest = self.spec.url.strip_prefix("nfs://")?;
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            return None;
        }
        Some(format!("{}:/{}", host, path.trim_end_matches('/')))
    }
}
