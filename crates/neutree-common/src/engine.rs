use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// Image an engine version runs with on one accelerator type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EngineImage {
    pub image_name: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineVersion {
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_schema: Option<serde_json::Value>,

    /// cluster type → deploy mode → base64 template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deploy_template: BTreeMap<String, BTreeMap<String, String>>,

    /// accelerator type → image.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, EngineImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineSpec {
    /// Ordered; later entries are newer.
    #[serde(default)]
    pub versions: Vec<EngineVersion>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Engine {
    pub metadata: Metadata,
    pub spec: EngineSpec,
}

impl Engine {
    pub fn version(&self, version: &str) -> Option<&EngineVersion> {
        self.spec.versions.iter().find(|v| v.version == version)
    }
}
