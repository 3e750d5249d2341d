pub mod accelerator;
pub mod cluster;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod exec;
pub mod image_registry;
pub mod metadata;
pub mod model_registry;

pub use accelerator::AcceleratorType;
pub use cluster::{
    AccessMode, Cluster, ClusterConfig, ClusterPhase, ClusterSpec, ClusterStatus, ClusterType,
    DockerConfig, HeadNodeSpec, KubernetesClusterConfig, SshAuth, SshClusterConfig, SshProvider,
    WorkerGroupSpec,
};
pub use endpoint::{
    DeploymentOptions, Endpoint, EndpointSpec, EngineRef, ModelRef, ReplicaSpec, ResourceSpec,
};
pub use engine::{Engine, EngineImage, EngineSpec, EngineVersion};
pub use error::ClusterError;
pub use exec::{ExecError, Executor, ProcessExecutor};
pub use image_registry::{
    ImageRegistry, ImageRegistryAuth, ImageRegistryPhase, ImageRegistrySpec, ImageRegistryStatus,
};
pub use metadata::Metadata;
pub use model_registry::{ModelRegistry, ModelRegistrySpec, ModelRegistryType};

pub mod telemetry;
