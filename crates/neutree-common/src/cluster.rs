use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::metadata::Metadata;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Ssh,
    Kubernetes,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Ssh => "ssh",
            ClusterType::Kubernetes => "kubernetes",
        }
    }
}

/// Lifecycle phase, advanced only by the cluster reconcile step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Draining,
    Deleted,
}

impl ClusterPhase {
    pub fn can_transition_to(self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;
        match (self, next) {
            (Deleted, _) => false,
            (a, b) if a == b => true,
            (Pending, Provisioning) => true,
            (Provisioning, Running) => true,
            (Running, Provisioning) => true,
            (_, Draining) => true,
            (Draining, Deleted) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    /// The serving runtime has been brought up at least once.
    #[serde(default)]
    pub initialized: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,

    /// Drives the base image tag.
    pub version: String,

    /// Name of the ImageRegistry (same workspace) the cluster pulls from.
    pub image_registry: String,

    /// Provision config, parsed according to `cluster_type`.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub metadata: Metadata,
    pub spec: ClusterSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

/// Parsed provision config.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterConfig {
    Ssh(SshClusterConfig),
    Kubernetes(KubernetesClusterConfig),
}

impl Cluster {
    pub fn key(&self) -> String {
        self.metadata.key()
    }

    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.initialized)
    }

    pub fn parse_config(&self) -> Result<ClusterConfig, ClusterError> {
        match self.spec.cluster_type {
            ClusterType::Ssh => self.ssh_config().map(ClusterConfig::Ssh),
            ClusterType::Kubernetes => self.kubernetes_config().map(ClusterConfig::Kubernetes),
        }
    }

    pub fn ssh_config(&self) -> Result<SshClusterConfig, ClusterError> {
        let cfg: SshClusterConfig = serde_json::from_value(self.spec.config.clone())
            .map_err(|e| ClusterError::Validation(format!("ssh cluster config: {e}")))?;
        if cfg.provider.head_ip.is_empty() {
            return Err(ClusterError::Validation("head ip is empty".into()));
        }
        if cfg.auth.ssh_user.is_empty() {
            return Err(ClusterError::Validation("ssh user is empty".into()));
        }
        Ok(cfg)
    }

    pub fn kubernetes_config(&self) -> Result<KubernetesClusterConfig, ClusterError> {
        let cfg: KubernetesClusterConfig = serde_json::from_value(self.spec.config.clone())
            .map_err(|e| ClusterError::Validation(format!("kubernetes cluster config: {e}")))?;
        if cfg.kubeconfig.is_empty() {
            return Err(ClusterError::DependencyUnavailable("kubeconfig is empty".into()));
        }
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// SSH provision config. Serialised as the serving runtime's cluster YAML.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SshClusterConfig {
    #[serde(default)]
    pub cluster_name: String,

    pub provider: SshProvider,

    pub auth: SshAuth,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initialization_commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub head_start_ray_commands: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_start_ray_commands: Vec<String>,

    /// Commands run inside the container of a statically listed worker.
    /// Not understood by the runtime, so it never reaches the bootstrap file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_worker_start_ray_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SshProvider {
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: String,

    pub head_ip: String,

    #[serde(default)]
    pub worker_ips: Vec<String>,
}

fn default_provider_type() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SshAuth {
    pub ssh_user: String,

    /// Base64 private key in stored records; a file path in the bootstrap copy.
    #[serde(default)]
    pub ssh_private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DockerConfig {
    #[serde(default)]
    pub image: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    #[serde(default)]
    pub pull_before_run: bool,

    #[serde(default)]
    pub run_options: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_run_options: Vec<String>,
}

pub fn default_container_name() -> String {
    "ray_container".to_string()
}

// ---------------------------------------------------------------------------
// Kubernetes provision config.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    LoadBalancer,
    NodePort,
    Ingress,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HeadNodeSpec {
    #[serde(default)]
    pub access_mode: AccessMode,

    /// Resource name → quantity, copied to container requests and limits.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerGroupSpec {
    pub group_name: String,

    #[serde(default)]
    pub min_replicas: i32,

    #[serde(default)]
    pub max_replicas: i32,

    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KubernetesClusterConfig {
    /// Base64-encoded kubeconfig.
    pub kubeconfig: String,

    #[serde(default)]
    pub head_node_spec: HeadNodeSpec,

    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,
}
