use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::metadata::Metadata;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EngineRef {
    pub engine: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModelRef {
    /// Name of the ModelRegistry holding the model.
    pub registry: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub task: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<f64>,
    /// GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accelerator: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSpec {
    #[serde(default = "default_replicas")]
    pub num: u32,
}

impl Default for ReplicaSpec {
    fn default() -> Self {
        Self { num: default_replicas() }
    }
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EndpointSpec {
    pub cluster: String,
    pub engine: EngineRef,
    pub model: ModelRef,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub replicas: ReplicaSpec,
    #[serde(default)]
    pub deployment_options: Map<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub metadata: Metadata,
    pub spec: EndpointSpec,
}

impl Endpoint {
    pub fn key(&self) -> String {
        self.metadata.key()
    }

    /// Serve application name: `<workspace>_<name>`.
    pub fn app_name(&self) -> String {
        format!("{}_{}", self.metadata.workspace, self.metadata.name)
    }

    /// Serve route prefix: `/<workspace>/<name>`.
    pub fn route_prefix(&self) -> String {
        format!("/{}/{}", self.metadata.workspace, self.metadata.name)
    }

    pub fn deployment_options(&self) -> DeploymentOptions {
        DeploymentOptions::from_map(&self.spec.deployment_options)
    }

    /// The `engine_args` variable, if it is an object.
    pub fn engine_args(&self) -> Map<String, Value> {
        match self.spec.variables.get("engine_args") {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        }
    }
}

/// Recognised keys of the free-form deployment options. Other keys are
/// kept in the record but not interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentOptions {
    pub deploy_mode: Option<String>,
    pub scheduler_type: Option<String>,
}

impl DeploymentOptions {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let deploy_mode = map
            .get("deploy_mode")
            .and_then(Value::as_str)
            .map(str::to_string);
        let scheduler_type = map
            .get("scheduler")
            .and_then(|s| s.get("type"))
            .or_else(|| map.get("scheduler.type"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            deploy_mode,
            scheduler_type,
        }
    }
}
