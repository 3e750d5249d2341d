//! Manager for clusters hosted on Kubernetes through the Ray operator.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use kube::Client;
use serde_json::Value;

use neutree_common::{
    AccessMode, Cluster, ClusterError, Endpoint, ImageRegistry, KubernetesClusterConfig,
    ModelRegistry,
};

use super::{connect_model, disconnect_model, ClusterManager, ManagerOptions, DASHBOARD_PORT, SERVE_PORT};
use crate::channel::pod::client_from_kubeconfig;
use crate::channel::{CommandChannel, PodChannel};
use crate::dashboard::{DashboardClient, NodeSummary};
use crate::deps::validate_images;

pub mod apply;
pub mod metrics;
pub mod objects;

use apply::{create_or_patch, KubeObjectApi, ObjectApi, ObjectKey};
use objects::{head_service_name, RenderedCluster, Renderer, RAY_CLUSTER_LABEL};

/// Opens exec channels into cluster pods.
pub trait PodExec: Send + Sync {
    fn channel(&self, namespace: &str, pod: &str, container: &str) -> Box<dyn CommandChannel>;
}

impl PodExec for Client {
    fn channel(&self, namespace: &str, pod: &str, container: &str) -> Box<dyn CommandChannel> {
        Box::new(PodChannel::new(self.clone(), namespace, pod, container))
    }
}

pub struct KubernetesClusterManager {
    cluster: Cluster,
    config: KubernetesClusterConfig,
    registry: ImageRegistry,
    opts: ManagerOptions,
    api: Arc<dyn ObjectApi>,
    pods: Arc<dyn PodExec>,
}

impl KubernetesClusterManager {
    pub async fn new(
        cluster: &Cluster,
        registry: ImageRegistry,
        opts: ManagerOptions,
    ) -> anyhow::Result<Self> {
        let config = cluster.kubernetes_config()?;
        let client = client_from_kubeconfig(&config.kubeconfig)
            .await
            .with_context(|| format!("connect to kubernetes for cluster {}", cluster.key()))?;
        Self::with_api(
            cluster,
            registry,
            opts,
            Arc::new(KubeObjectApi::new(client.clone())),
            Arc::new(client),
        )
    }

    pub fn with_api(
        cluster: &Cluster,
        registry: ImageRegistry,
        opts: ManagerOptions,
        api: Arc<dyn ObjectApi>,
        pods: Arc<dyn PodExec>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            cluster: cluster.clone(),
            config: cluster.kubernetes_config()?,
            registry,
            opts,
            api,
            pods,
        })
    }

    fn render(&self) -> anyhow::Result<RenderedCluster> {
        Renderer::new(&self.cluster, &self.config, &self.registry).render()
    }

    fn namespace(&self) -> String {
        objects::namespace_name(&self.cluster)
    }

    /// First ingress address of the head service.
    async fn access_ip(&self) -> anyhow::Result<String> {
        if self.config.head_node_spec.access_mode != AccessMode::LoadBalancer {
            bail!(ClusterError::Unsupported(format!(
                "head access mode {:?}",
                self.config.head_node_spec.access_mode
            )));
        }
        let key = ObjectKey {
            api_version: "v1".into(),
            kind: "Service".into(),
            namespace: Some(self.namespace()),
            name: head_service_name(&self.cluster),
        };
        let svc = self
            .api
            .get(&key)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("service {key}")))?;
        let ingress = svc
            .pointer("/status/loadBalancer/ingress/0")
            .and_then(|i| i.get("ip").or_else(|| i.get("hostname")))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        match ingress {
            Some(ip) => Ok(ip.to_string()),
            None => bail!("service {key} has no load balancer ingress yet"),
        }
    }

    fn dashboard(&self, ip: &str) -> anyhow::Result<DashboardClient> {
        Ok(DashboardClient::with_timeout(
            format!("http://{ip}:{DASHBOARD_PORT}"),
            self.opts.dashboard_timeout,
        )?)
    }

    async fn sync_metrics_config(&self, nodes: &[NodeSummary]) -> anyhow::Result<()> {
        metrics::sync_scrape_config(
            self.api.as_ref(),
            &self.namespace(),
            &self.cluster.metadata.name,
            nodes,
        )
        .await
        .with_context(|| format!("sync metrics config of cluster {}", self.cluster.key()))?;
        Ok(())
    }

    /// Running pods of the cluster with their first container.
    async fn running_pods(&self) -> anyhow::Result<Vec<(String, String)>> {
        let selector = format!("{RAY_CLUSTER_LABEL}={}", self.cluster.metadata.name);
        let pods = self
            .api
            .list("v1", "Pod", &self.namespace(), &selector)
            .await?;
        Ok(pods
            .iter()
            .filter(|p| p.pointer("/status/phase").and_then(Value::as_str) == Some("Running"))
            .filter_map(|p| {
                let name = p.pointer("/metadata/name")?.as_str()?;
                let container = p.pointer("/spec/containers/0/name")?.as_str()?;
                Some((name.to_string(), container.to_string()))
            })
            .collect())
    }
}

#[async_trait]
impl ClusterManager for KubernetesClusterManager {
    async fn up_cluster(&self, _restart: bool) -> anyhow::Result<String> {
        let rendered = self.render()?;
        validate_images(&self.registry, &rendered.images)
            .await
            .with_context(|| format!("validate dependencies of cluster {}", self.cluster.key()))?;

        for obj in &rendered.objects {
            create_or_patch(self.api.as_ref(), obj).await?;
        }
        tracing::info!(cluster = %self.cluster.key(), namespace = %rendered.namespace, "objects applied");
        self.access_ip().await
    }

    async fn down_cluster(&self) -> anyhow::Result<()> {
        let rendered = self.render()?;
        let mut remaining = 0;
        for obj in rendered.objects.iter().rev() {
            let key = ObjectKey::of(obj)?;
            if self.api.get(&key).await?.is_some() {
                self.api.delete(&key).await?;
                remaining += 1;
            }
        }
        if remaining > 0 {
            tracing::info!(cluster = %self.cluster.key(), remaining, "waiting for objects to go away");
            bail!(ClusterError::WaitForDeletion(self.cluster.key()));
        }
        Ok(())
    }

    async fn sync(&self) -> anyhow::Result<()> {
        let ip = self.up_cluster(false).await?;
        let nodes = self
            .dashboard(&ip)?
            .list_nodes()
            .await
            .with_context(|| format!("list nodes of cluster {}", self.cluster.key()))?;
        self.sync_metrics_config(&nodes).await
    }

    async fn start_node(&self, _ip: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop_node(&self, _ip: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn connect_endpoint_model(
        &self,
        endpoint: &Endpoint,
        model_registry: &ModelRegistry,
    ) -> anyhow::Result<()> {
        let ns = self.namespace();
        for (pod, container) in self.running_pods().await? {
            let channel = self.pods.channel(&ns, &pod, &container);
            connect_model(channel.as_ref(), endpoint, model_registry)
                .await
                .with_context(|| format!("connect model on pod {pod}"))?;
        }
        Ok(())
    }

    async fn disconnect_endpoint_model(
        &self,
        endpoint: &Endpoint,
        model_registry: &ModelRegistry,
    ) -> anyhow::Result<()> {
        let ns = self.namespace();
        for (pod, container) in self.running_pods().await? {
            let channel = self.pods.channel(&ns, &pod, &container);
            if let Err(e) = disconnect_model(channel.as_ref(), endpoint, model_registry).await {
                tracing::warn!(%pod, error = %e, "disconnect model failed");
            }
        }
        Ok(())
    }

    async fn dashboard_service(&self) -> anyhow::Result<String> {
        Ok(format!("http://{}:{DASHBOARD_PORT}", self.access_ip().await?))
    }

    async fn serve_endpoint(&self) -> anyhow::Result<String> {
        Ok(format!("http://{}:{SERVE_PORT}", self.access_ip().await?))
    }

    fn desired_static_workers_ip(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use neutree_common::exec::testing::ScriptedExecutor;
    use neutree_common::ModelRegistryType;
    use serde_json::json;

    use super::apply::fake::MemoryObjectApi;
    use super::objects::tests::{k8s_cluster, k8s_config};
    use crate::channel::SshChannel;
    use crate::dashboard::tests::FakeDashboard;
    use crate::deps::tests::{fake_registry, registry};
    use crate::manager::tests::{endpoint, model_registry};

    /// Pod channels backed by a scripted executor; the pod name stands in for
    /// the node address.
    struct ScriptedPods(Arc<ScriptedExecutor>);

    impl PodExec for ScriptedPods {
        fn channel(&self, _ns: &str, pod: &str, _container: &str) -> Box<dyn CommandChannel> {
            Box::new(SshChannel::new(
                self.0.clone(),
                Path::new("/tmp"),
                "",
                "root",
                pod,
                "/k",
            ))
        }
    }

    const ALL_IMAGES: &[&str] = &[
        "vmagent:v1.115.0",
        "neutree-serve:v1.0.0",
        "neutree-serve:v1.0.0-ascend-910b",
    ];

    struct Fixture {
        api: Arc<MemoryObjectApi>,
        exec: Arc<ScriptedExecutor>,
        manager: KubernetesClusterManager,
    }

    async fn fixture(images: &[&str], config: KubernetesClusterConfig) -> Fixture {
        let url = fake_registry(images).await;
        let cluster = k8s_cluster(&config);
        let api = Arc::new(MemoryObjectApi::default());
        let exec = Arc::new(ScriptedExecutor::new());
        let manager = KubernetesClusterManager::with_api(
            &cluster,
            registry(&url),
            ManagerOptions::default(),
            api.clone(),
            Arc::new(ScriptedPods(exec.clone())),
        )
        .unwrap();
        Fixture { api, exec, manager }
    }

    fn head_service(f: &Fixture, ingress: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "prod-head-svc",
                "namespace": f.manager.namespace(),
            },
            "status": {"loadBalancer": {"ingress": ingress}},
        })
    }

    fn pod(f: &Fixture, name: &str, phase: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": f.manager.namespace(),
                "labels": {RAY_CLUSTER_LABEL: "prod"},
            },
            "spec": {"containers": [{"name": "ray-worker"}]},
            "status": {"phase": phase},
        })
    }

    #[tokio::test]
    async fn test_up_cluster_applies_and_returns_ingress() {
        let f = fixture(ALL_IMAGES, k8s_config()).await;
        f.api.insert(head_service(&f, json!([{"ip": "192.168.1.50"}])));

        assert_eq!(f.manager.up_cluster(false).await.unwrap(), "192.168.1.50");
        let creates: Vec<String> = f
            .api
            .mutations()
            .into_iter()
            .filter(|o| o.starts_with("create "))
            .collect();
        assert_eq!(creates.len(), 6);
        assert!(creates[0].starts_with("create Namespace/neutree-cluster-"));
        assert!(creates[5].starts_with("create RayCluster/"));

        // A second up against unchanged objects mutates nothing.
        let before = f.api.objects.lock().unwrap().clone();
        f.manager.up_cluster(false).await.unwrap();
        assert_eq!(*f.api.objects.lock().unwrap(), before);
        assert_eq!(f.api.mutations().len(), 6);

        assert_eq!(
            f.manager.dashboard_service().await.unwrap(),
            "http://192.168.1.50:8265"
        );
        assert_eq!(f.manager.serve_endpoint().await.unwrap(), "http://192.168.1.50:8000");
    }

    #[tokio::test]
    async fn test_up_cluster_validates_before_applying() {
        let f = fixture(&["neutree-serve:v1.0.0"], k8s_config()).await;
        let err = f.manager.up_cluster(false).await.unwrap_err();
        assert!(matches!(
            ClusterError::find(&err),
            Some(ClusterError::DependencyUnavailable(_))
        ));
        assert!(f.api.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_up_cluster_without_ingress_or_unsupported_mode() {
        let f = fixture(ALL_IMAGES, k8s_config()).await;
        f.api.insert(head_service(&f, json!([])));
        let err = f.manager.up_cluster(false).await.unwrap_err();
        assert!(err.to_string().contains("no load balancer ingress"));

        let mut cfg = k8s_config();
        cfg.head_node_spec.access_mode = AccessMode::NodePort;
        let f = fixture(ALL_IMAGES, cfg).await;
        let err = f.manager.up_cluster(false).await.unwrap_err();
        assert!(matches!(ClusterError::find(&err), Some(ClusterError::Unsupported(_))));
        assert_eq!(
            f.api.mutations().iter().filter(|o| o.starts_with("create ")).count(),
            6
        );
    }

    #[tokio::test]
    async fn test_down_cluster_sweeps_in_reverse_until_gone() {
        let f = fixture(ALL_IMAGES, k8s_config()).await;
        f.api.insert(head_service(&f, json!([{"ip": "192.168.1.50"}])));
        f.manager.up_cluster(false).await.unwrap();

        let ns_key = format!("Namespace/{}", f.manager.namespace());
        f.api.sticky.lock().unwrap().push(ns_key.clone());

        let err = f.manager.down_cluster().await.unwrap_err();
        assert!(ClusterError::is_wait_for_deletion(&err));
        let deletes: Vec<String> = f
            .api
            .mutations()
            .into_iter()
            .filter(|o| o.starts_with("delete "))
            .collect();
        assert!(deletes[0].starts_with("delete RayCluster/"));
        assert_eq!(deletes.last().unwrap(), &format!("delete {ns_key}"));

        // Namespace still terminating.
        assert!(ClusterError::is_wait_for_deletion(
            &f.manager.down_cluster().await.unwrap_err()
        ));

        f.api.sticky.lock().unwrap().clear();
        f.api.objects.lock().unwrap().remove(&ns_key);
        f.manager.down_cluster().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_metrics_config() {
        let dash = FakeDashboard::default();
        dash.node("10.0.0.1", "head-id", true, "ALIVE");
        dash.node("10.0.0.2", "w-id", false, "ALIVE");
        let nodes = DashboardClient::new(dash.serve().await)
            .unwrap()
            .list_nodes()
            .await
            .unwrap();

        let f = fixture(ALL_IMAGES, k8s_config()).await;
        f.api.insert(head_service(&f, json!([{"ip": "10.0.0.1"}])));
        f.manager.up_cluster(false).await.unwrap();
        f.manager.sync_metrics_config(&nodes).await.unwrap();

        let key = format!("ConfigMap/{}/vmagent-scrape-config", f.manager.namespace());
        let cm = f.api.object(&key).unwrap();
        let scrape = cm["data"]["cluster.json"].as_str().unwrap();
        assert!(scrape.contains("10.0.0.1:44227"));
        assert!(scrape.contains("10.0.0.2:54311"));
        assert_eq!(cm["metadata"]["annotations"][objects::SKIP_PATCH_ANNOTATION], "true");

        // A reapply leaves the out-of-band data alone.
        f.manager.up_cluster(false).await.unwrap();
        assert_eq!(f.api.object(&key).unwrap()["data"]["cluster.json"], scrape);
    }

    #[tokio::test]
    async fn test_connect_model_on_running_pods() {
        let f = fixture(ALL_IMAGES, k8s_config()).await;
        f.api.insert(pod(&f, "prod-head", "Running"));
        f.api.insert(pod(&f, "prod-worker-1", "Pending"));
        f.api.insert(pod(&f, "prod-worker-2", "Running"));

        let mr = model_registry(ModelRegistryType::BentoMl, "nfs://nas/export");
        f.manager.connect_endpoint_model(&endpoint(), &mr).await.unwrap();
        let mounts = f.exec.calls_matching("mount -t nfs nas:/export /mnt/ws/chat/ws/models/qwen");
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().any(|c| c.contains("root@prod-head")));
        assert!(mounts.iter().any(|c| c.contains("root@prod-worker-2")));

        let hf = model_registry(ModelRegistryType::HuggingFace, "https://huggingface.co");
        let calls = f.exec.calls().len();
        f.manager.connect_endpoint_model(&endpoint(), &hf).await.unwrap();
        f.manager.disconnect_endpoint_model(&endpoint(), &hf).await.unwrap();
        assert_eq!(f.exec.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_node_operations_are_noops() {
        let f = fixture(ALL_IMAGES, k8s_config()).await;
        f.manager.start_node("10.0.0.9").await.unwrap();
        f.manager.stop_node("10.0.0.9").await.unwrap();
        assert!(f.manager.desired_static_workers_ip().is_empty());
        assert!(f.api.ops().is_empty());
    }
}
