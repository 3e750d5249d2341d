//! Cluster lifecycle and endpoint deployment on the distributed serving runtime.

pub mod channel;
pub mod config;
pub mod dashboard;
pub mod deps;
pub mod endpoint;
pub mod manager;
pub mod nfs;
pub mod reconcile;

pub use channel::{CommandChannel, DockerChannel, PodChannel, RunEnv, RunOptions, SshChannel};
pub use config::ConfigManager;
pub use dashboard::{DashboardClient, DashboardError};
pub use endpoint::{build_serve_application, deploy_endpoint, remove_endpoint};
pub use manager::{
    new_cluster_manager, ClusterManager, KubernetesClusterManager, ManagerOptions,
    SshClusterManager,
};
pub use nfs::NfsMounter;
pub use reconcile::{reconcile, reconcile_cluster, ReconcileResult};
