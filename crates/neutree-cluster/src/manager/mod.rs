//! Cluster managers: one capability set, an SSH and a Kubernetes backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use neutree_common::{
    Cluster, ClusterError, ClusterType, Endpoint, Executor, ImageRegistry, ModelRegistry,
    ModelRegistryType, ProcessExecutor,
};

use crate::channel::CommandChannel;
use crate::nfs::NfsMounter;

pub mod kubernetes;
pub mod ssh;

pub use kubernetes::KubernetesClusterManager;
pub use ssh::SshClusterManager;

pub const DASHBOARD_PORT: u16 = 8265;
pub const SERVE_PORT: u16 = 8000;
pub const GCS_PORT: u16 = 6379;
pub const RAYLET_METRICS_PORT: u16 = 54311;
pub const DASHBOARD_METRICS_PORT: u16 = 44227;
pub const AUTOSCALER_METRICS_PORT: u16 = 44217;

#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Brings the cluster up and returns the head address.
    async fn up_cluster(&self, restart: bool) -> anyhow::Result<String>;

    async fn down_cluster(&self) -> anyhow::Result<()>;

    /// Periodic reconciliation of a running cluster.
    async fn sync(&self) -> anyhow::Result<()>;

    async fn start_node(&self, ip: &str) -> anyhow::Result<()>;

    async fn stop_node(&self, ip: &str) -> anyhow::Result<()>;

    async fn connect_endpoint_model(
        &self,
        endpoint: &Endpoint,
        model_registry: &ModelRegistry,
    ) -> anyhow::Result<()>;

    async fn disconnect_endpoint_model(
        &self,
        endpoint: &Endpoint,
        model_registry: &ModelRegistry,
    ) -> anyhow::Result<()>;

    /// Dashboard base URL.
    async fn dashboard_service(&self) -> anyhow::Result<String>;

    /// Serve (HTTP ingress) base URL.
    async fn serve_endpoint(&self) -> anyhow::Result<String>;

    fn desired_static_workers_ip(&self) -> Vec<String>;
}

/// Settings shared by both backends.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Base for bootstrap files, state files and SSH control sockets.
    pub tmp_dir: PathBuf,
    pub executor: Arc<dyn Executor>,
    /// The serving runtime's CLI.
    pub ray_binary: String,
    pub dashboard_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        let tmp_dir = std::env::var_os("RAY_TMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            tmp_dir,
            executor: Arc::new(ProcessExecutor),
            ray_binary: "ray".to_string(),
            dashboard_timeout: crate::dashboard::DEFAULT_TIMEOUT,
        }
    }
}

/// Builds the manager for the cluster's type. Managers are created per
/// reconcile and never cached.
pub async fn new_cluster_manager(
    cluster: &Cluster,
    registry: &ImageRegistry,
    opts: ManagerOptions,
) -> anyhow::Result<Box<dyn ClusterManager>> {
    match cluster.spec.cluster_type {
        ClusterType::Ssh => Ok(Box::new(
            SshClusterManager::new(cluster, registry.clone(), opts).await?,
        )),
        ClusterType::Kubernetes => Ok(Box::new(
            KubernetesClusterManager::new(cluster, registry.clone(), opts).await?,
        )),
    }
}

/// `/mnt/<endpoint key>/<model registry key>/<model name>`.
pub fn model_mount_path(endpoint: &Endpoint, model_registry: &ModelRegistry) -> String {
    format!(
        "/mnt/{}/{}/{}",
        endpoint.key(),
        model_registry.key(),
        endpoint.spec.model.name
    )
}

/// NFS source for registries that need a mount, `None` for those that don't.
fn mount_source(model_registry: &ModelRegistry) -> anyhow::Result<Option<String>> {
    match model_registry.spec.registry_type {
        ModelRegistryType::HuggingFace => Ok(None),
        ModelRegistryType::BentoMl => match model_registry.nfs_source() {
            Some(source) => Ok(Some(source)),
            None => bail!(ClusterError::Unsupported(format!(
                "bentoml model registry url {}",
                model_registry.spec.url
            ))),
        },
    }
}

pub(crate) async fn connect_model(
    channel: &dyn CommandChannel,
    endpoint: &Endpoint,
    model_registry: &ModelRegistry,
) -> anyhow::Result<()> {
    let Some(source) = mount_source(model_registry)? else {
        return Ok(());
    };
    NfsMounter::new(channel)
        .mount(&source, &model_mount_path(endpoint, model_registry))
        .await
}

pub(crate) async fn disconnect_model(
    channel: &dyn CommandChannel,
    endpoint: &Endpoint,
    model_registry: &ModelRegistry,
) -> anyhow::Result<()> {
    if mount_source(model_registry)?.is_none() {
        return Ok(());
    }
    NfsMounter::new(channel)
        .unmount(&model_mount_path(endpoint, model_registry))
        .await
}
