use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::metadata::Metadata;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageRegistryPhase {
    #[default]
    Pending,
    Connected,
    Failed,
    Deleted,
}

/// Docker-style credentials. At most one of the secrets is expected to be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImageRegistryAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    #[serde(default, rename = "identitytoken", skip_serializing_if = "String::is_empty")]
    pub identity_token: String,

    #[serde(default, rename = "registrytoken", skip_serializing_if = "String::is_empty")]
    pub registry_token: String,
}

impl ImageRegistryAuth {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.identity_token.is_empty()
            && self.registry_token.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImageRegistrySpec {
    /// e.g. `https://registry.example.com`
    pub url: String,

    /// Project / namespace path inside the registry.
    pub repository: String,

    #[serde(default)]
    pub authconfig: ImageRegistryAuth,

    /// PEM bundle trusted in addition to the system roots.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImageRegistryStatus {
    #[serde(default)]
    pub phase: ImageRegistryPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRegistry {
    pub metadata: Metadata,
    pub spec: ImageRegistrySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageRegistryStatus>,
}

impl ImageRegistry {
    pub fn phase(&self) -> ImageRegistryPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Refuses registries that are not connected or lack a URL/repository.
    pub fn ensure_usable(&self) -> Result<(), ClusterError> {
        if self.phase() != ImageRegistryPhase::Connected {
            return Err(ClusterError::DependencyUnavailable(format!(
                "image registry {} not connected",
                self.metadata.name
            )));
        }
        if self.spec.url.is_empty() || self.spec.repository.is_empty() {
            return Err(ClusterError::DependencyUnavailable(format!(
                "image registry {} url or repository is empty",
                self.metadata.name
            )));
        }
        Ok(())
    }

    /// Registry host (and port) with the scheme stripped.
    pub fn host(&self) -> &str {
        let url = self.spec.url.trim_end_matches('/');
        url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
    }

    /// Whether the registry URL asks for plain HTTP.
    pub fn insecure(&self) -> bool {
        self.spec.url.starts_with("http://")
    }

    /// `<host>/<repository>`, the prefix images are addressed under.
    pub fn image_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.host(),
            self.spec.repository.trim_matches('/')
        )
    }
}
