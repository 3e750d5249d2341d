//! Rendering of the object set that materializes a cluster on Kubernetes.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use neutree_common::{AcceleratorType, Cluster, ImageRegistry, KubernetesClusterConfig};

use crate::deps::serve_image;
use crate::manager::{
    AUTOSCALER_METRICS_PORT, DASHBOARD_METRICS_PORT, DASHBOARD_PORT, GCS_PORT,
    RAYLET_METRICS_PORT, SERVE_PORT,
};

pub const SKIP_PATCH_ANNOTATION: &str = "neutree.io/skip-patch";
pub const CLUSTER_LABEL: &str = "neutree-cluster";
pub const WORKSPACE_LABEL: &str = "neutree-cluster-workspace";
/// Label the Ray operator puts on every pod of a cluster.
pub const RAY_CLUSTER_LABEL: &str = "ray.io/cluster";

pub const IMAGE_PULL_SECRET: &str = "neutree-image-pull-secret";
pub const VMAGENT_CONFIG: &str = "vmagent-config";
pub const VMAGENT_SCRAPE_CONFIG: &str = "vmagent-scrape-config";
pub const VMAGENT: &str = "vmagent";
pub const VMAGENT_VERSION: &str = "v1.115.0";
pub const SCRAPE_FILE: &str = "cluster.json";

const HEAD_CONTAINER: &str = "ray-head";
const WORKER_CONTAINER: &str = "ray-worker";

/// `neutree-cluster-<hash of workspace/name>`.
pub fn namespace_name(cluster: &Cluster) -> String {
    let digest = Sha256::digest(cluster.key().as_bytes());
    let hex: String = digest.iter().take(5).map(|b| format!("{b:02x}")).collect();
    format!("neutree-cluster-{hex}")
}

pub fn head_service_name(cluster: &Cluster) -> String {
    format!("{}-head-svc", cluster.metadata.name)
}

/// The objects of one cluster in apply order, and the images they need.
#[derive(Debug, Clone)]
pub struct RenderedCluster {
    pub namespace: String,
    pub objects: Vec<Value>,
    pub images: Vec<String>,
}

pub struct Renderer<'a> {
    cluster: &'a Cluster,
    config: &'a KubernetesClusterConfig,
    registry: &'a ImageRegistry,
    namespace: String,
}

impl<'a> Renderer<'a> {
    pub fn new(
        cluster: &'a Cluster,
        config: &'a KubernetesClusterConfig,
        registry: &'a ImageRegistry,
    ) -> Self {
        Self {
            cluster,
            config,
            registry,
            namespace: namespace_name(cluster),
        }
    }

    pub fn labels(&self) -> Value {
        json!({
            CLUSTER_LABEL: self.cluster.metadata.name,
            WORKSPACE_LABEL: self.cluster.metadata.workspace,
        })
    }

    fn metadata(&self, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": self.namespace,
            "labels": self.labels(),
        })
    }

    pub fn render(&self) -> anyhow::Result<RenderedCluster> {
        let mut images = Vec::new();
        let mut push_image = |image: String| {
            if !images.contains(&image) {
                images.push(image);
            }
        };

        let vmagent_image = format!("{}/vmagent:{VMAGENT_VERSION}", self.registry.image_prefix());
        push_image(vmagent_image.clone());

        let head = self.head_group();
        push_image(head.1);
        let mut workers = Vec::new();
        for group in &self.config.worker_group_specs {
            let (spec, image) = self.worker_group(group);
            push_image(image);
            workers.push(spec);
        }

        let objects = vec![
            self.namespace_object(),
            self.pull_secret()?,
            self.vmagent_config(),
            self.vmagent_scrape_config(),
            self.vmagent_deployment(&vmagent_image),
            self.ray_cluster(head.0, workers),
        ];
        Ok(RenderedCluster {
            namespace: self.namespace.clone(),
            objects,
            images,
        })
    }

    fn namespace_object(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": self.namespace, "labels": self.labels()},
        })
    }

    fn pull_secret(&self) -> anyhow::Result<Value> {
        let auth = &self.registry.spec.authconfig;
        let mut entry = serde_json::Map::new();
        if !auth.username.is_empty() || !auth.password.is_empty() {
            entry.insert("username".into(), json!(auth.username));
            entry.insert("password".into(), json!(auth.password));
            entry.insert(
                "auth".into(),
                json!(BASE64.encode(format!("{}:{}", auth.username, auth.password))),
            );
        }
        if !auth.identity_token.is_empty() {
            entry.insert("identitytoken".into(), json!(auth.identity_token));
        }
        if !auth.registry_token.is_empty() {
            entry.insert("registrytoken".into(), json!(auth.registry_token));
        }
        let docker_config = json!({"auths": {self.registry.host(): entry}});
        let raw = serde_json::to_string(&docker_config)?.replace('\\', "");

        Ok(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": self.metadata(IMAGE_PULL_SECRET),
            "type": "kubernetes.io/dockerconfigjson",
            "data": {".dockerconfigjson": BASE64.encode(raw)},
        }))
    }

    fn vmagent_config(&self) -> Value {
        let scrape = format!(
            "global:\n  scrape_interval: 30s\nscrape_configs:\n  - job_name: ray\n    file_sd_configs:\n      - files:\n          - /etc/vmagent/scrape/{SCRAPE_FILE}\n"
        );
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": self.metadata(VMAGENT_CONFIG),
            "data": {"prometheus.yml": scrape},
        })
    }

    fn vmagent_scrape_config(&self) -> Value {
        let mut metadata = self.metadata(VMAGENT_SCRAPE_CONFIG);
        metadata["annotations"] = json!({ SKIP_PATCH_ANNOTATION: "true" });
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": metadata,
            "data": {SCRAPE_FILE: "[]"},
        })
    }

    fn vmagent_deployment(&self, image: &str) -> Value {
        let mut selector = self.labels();
        selector["app"] = json!(VMAGENT);
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": self.metadata(VMAGENT),
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": selector},
                "template": {
                    "metadata": {"labels": selector},
                    "spec": {
                        "imagePullSecrets": [{"name": IMAGE_PULL_SECRET}],
                        "containers": [{
                            "name": VMAGENT,
                            "image": image,
                            "args": [
                                "-promscrape.config=/etc/vmagent/prometheus.yml",
                                "-promscrape.configCheckInterval=10s",
                            ],
                            "volumeMounts": [
                                {"name": "config", "mountPath": "/etc/vmagent"},
                                {"name": "scrape", "mountPath": "/etc/vmagent/scrape"},
                            ],
                        }],
                        "volumes": [
                            {"name": "config", "configMap": {"name": VMAGENT_CONFIG}},
                            {"name": "scrape", "configMap": {"name": VMAGENT_SCRAPE_CONFIG}},
                        ],
                    },
                },
            },
        })
    }

    /// Container for one node kind. Returns it with the image it runs.
    fn container(
        &self,
        name: &str,
        start: String,
        resources: &BTreeMap<String, String>,
        ports: Value,
    ) -> (Value, String) {
        let accelerator = AcceleratorType::from_resource_keys(resources.keys());
        let image = serve_image(self.registry, &self.cluster.spec.version, accelerator);

        let mut env = vec![
            json!({"name": "DASHBOARD_METRIC_PORT", "value": DASHBOARD_METRICS_PORT.to_string()}),
            json!({"name": "AUTOSCALER_METRIC_PORT", "value": AUTOSCALER_METRICS_PORT.to_string()}),
        ];
        if !accelerator.is_nvidia() {
            env.push(json!({"name": "NVIDIA_VISIBLE_DEVICES", "value": "void"}));
        }
        if !accelerator.is_ascend() {
            env.push(json!({"name": "ASCEND_VISIBLE_DEVICES", "value": "void"}));
        }

        let mut container = json!({
            "name": name,
            "image": image,
            "imagePullPolicy": "IfNotPresent",
            "command": ["/bin/bash", "-lc", "--"],
            "args": [start],
            "env": env,
            "resources": {"requests": resources, "limits": resources},
            "ports": ports,
        });
        if name == HEAD_CONTAINER {
            container["securityContext"] = json!({"capabilities": {"add": ["SYS_ADMIN"]}});
        }
        (container, image)
    }

    fn pod_template(&self, container: Value) -> Value {
        json!({
            "metadata": {"labels": self.labels()},
            "spec": {
                "imagePullSecrets": [{"name": IMAGE_PULL_SECRET}],
                "containers": [container],
            },
        })
    }

    fn head_group(&self) -> (Value, String) {
        let start = format!(
            "ulimit -n 65536; ray start --head --block --port={GCS_PORT} \
             --dashboard-host=0.0.0.0 --dashboard-port={DASHBOARD_PORT} \
             --metrics-export-port={RAYLET_METRICS_PORT} --disable-usage-stats"
        );
        let ports = json!([
            {"name": "metrics", "containerPort": RAYLET_METRICS_PORT},
            {"name": "dash-metrics", "containerPort": DASHBOARD_METRICS_PORT},
            {"name": "auto-metrics", "containerPort": AUTOSCALER_METRICS_PORT},
            {"name": "serve", "containerPort": SERVE_PORT},
            {"name": "gcs", "containerPort": GCS_PORT},
            {"name": "dashboard", "containerPort": DASHBOARD_PORT},
        ]);
        let (container, image) = self.container(
            HEAD_CONTAINER,
            start,
            &self.config.head_node_spec.resources,
            ports,
        );
        let group = json!({
            "serviceType": "LoadBalancer",
            "rayStartParams": {},
            "template": self.pod_template(container),
        });
        (group, image)
    }

    fn worker_group(&self, spec: &neutree_common::WorkerGroupSpec) -> (Value, String) {
        let start = format!(
            "ulimit -n 65536; ray start --block --address={}:{GCS_PORT} \
             --metrics-export-port={RAYLET_METRICS_PORT} --disable-usage-stats",
            head_service_name(self.cluster)
        );
        let ports = json!([{"name": "metrics", "containerPort": RAYLET_METRICS_PORT}]);
        let (container, image) = self.container(WORKER_CONTAINER, start, &spec.resources, ports);
        let group = json!({
            "groupName": spec.group_name,
            "replicas": spec.min_replicas,
            "minReplicas": spec.min_replicas,
            "maxReplicas": spec.max_replicas,
            "rayStartParams": {},
            "template": self.pod_template(container),
        });
        (group, image)
    }

    fn ray_cluster(&self, head: Value, workers: Vec<Value>) -> Value {
        let mut metadata = self.metadata(&self.cluster.metadata.name);
        metadata["annotations"] = json!({"ray.io/overwrite-container-cmd": "true"});
        json!({
            "apiVersion": "ray.io/v1",
            "kind": "RayCluster",
            "metadata": metadata,
            "spec": {
                "enableInTreeAutoscaling": true,
                "autoscalerOptions": {"idleTimeoutSeconds": 60},
                "headGroupSpec": head,
                "workerGroupSpecs": workers,
            },
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use neutree_common::{
        ClusterSpec, ClusterType, HeadNodeSpec, ImageRegistryAuth, Metadata, WorkerGroupSpec,
    };

    use crate::deps::tests::registry;

    pub(crate) fn k8s_config() -> KubernetesClusterConfig {
        KubernetesClusterConfig {
            kubeconfig: String::new(),
            head_node_spec: HeadNodeSpec {
                resources: BTreeMap::from([("cpu".into(), "4".into())]),
                ..Default::default()
            },
            worker_group_specs: vec![
                WorkerGroupSpec {
                    group_name: "gpu".into(),
                    min_replicas: 1,
                    max_replicas: 4,
                    resources: BTreeMap::from([
                        ("cpu".into(), "8".into()),
                        ("nvidia.com/gpu".into(), "1".into()),
                    ]),
                },
                WorkerGroupSpec {
                    group_name: "npu".into(),
                    min_replicas: 0,
                    max_replicas: 2,
                    resources: BTreeMap::from([("huawei.com/Ascend910B".into(), "1".into())]),
                },
            ],
        }
    }

    pub(crate) fn k8s_cluster(config: &KubernetesClusterConfig) -> Cluster {
        Cluster {
            metadata: Metadata::new("ws", "prod"),
            spec: ClusterSpec {
                cluster_type: ClusterType::Kubernetes,
                version: "v1.0.0".into(),
                image_registry: "hub".into(),
                config: serde_json::to_value(config).unwrap(),
            },
            status: None,
        }
    }

    fn env_of(container: &Value) -> Vec<(String, String)> {
        container["env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e["name"].as_str().unwrap().to_string(),
                    e["value"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_namespace_is_stable_per_cluster() {
        let cfg = k8s_config();
        let a = k8s_cluster(&cfg);
        let mut b = k8s_cluster(&cfg);
        assert_eq!(namespace_name(&a), namespace_name(&b));
        assert!(namespace_name(&a).starts_with("neutree-cluster-"));
        b.metadata.workspace = "other".into();
        assert_ne!(namespace_name(&a), namespace_name(&b));
    }

    #[test]
    fn test_render_object_set() {
        let cfg = k8s_config();
        let cluster = k8s_cluster(&cfg);
        let reg = registry("https://registry.example.com");
        let rendered = Renderer::new(&cluster, &cfg, &reg).render().unwrap();

        let kinds: Vec<&str> = rendered
            .objects
            .iter()
            .map(|o| o["kind"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            ["Namespace", "Secret", "ConfigMap", "ConfigMap", "Deployment", "RayCluster"]
        );
        for obj in &rendered.objects {
            assert_eq!(obj["metadata"]["labels"][CLUSTER_LABEL], "prod");
            assert_eq!(obj["metadata"]["labels"][WORKSPACE_LABEL], "ws");
        }
        assert_eq!(
            rendered.objects[3]["metadata"]["annotations"][SKIP_PATCH_ANNOTATION],
            "true"
        );
        assert_eq!(
            rendered.images,
            [
                "registry.example.com/neutree/vmagent:v1.115.0",
                "registry.example.com/neutree/neutree-serve:v1.0.0",
                "registry.example.com/neutree/neutree-serve:v1.0.0-ascend-910b",
            ]
        );
    }

    #[test]
    fn test_ray_cluster_pods() {
        let cfg = k8s_config();
        let cluster = k8s_cluster(&cfg);
        let reg = registry("https://registry.example.com");
        let rendered = Renderer::new(&cluster, &cfg, &reg).render().unwrap();
        let ray = &rendered.objects[5]["spec"];
        assert_eq!(ray["enableInTreeAutoscaling"], true);

        let head = &ray["headGroupSpec"]["template"]["spec"]["containers"][0];
        assert_eq!(head["securityContext"]["capabilities"]["add"][0], "SYS_ADMIN");
        assert_eq!(head["resources"]["limits"]["cpu"], "4");
        let ports: Vec<&str> = head["ports"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(ports, ["metrics", "dash-metrics", "auto-metrics", "serve", "gcs", "dashboard"]);
        let env = env_of(head);
        assert!(env.contains(&("NVIDIA_VISIBLE_DEVICES".into(), "void".into())));
        assert!(env.contains(&("ASCEND_VISIBLE_DEVICES".into(), "void".into())));
        assert_eq!(
            ray["headGroupSpec"]["template"]["spec"]["imagePullSecrets"][0]["name"],
            IMAGE_PULL_SECRET
        );

        let gpu = &ray["workerGroupSpecs"][0];
        assert_eq!((gpu["minReplicas"].as_i64(), gpu["maxReplicas"].as_i64()), (Some(1), Some(4)));
        let gpu = &gpu["template"]["spec"]["containers"][0];
        assert!(gpu["args"][0].as_str().unwrap().contains("--address=prod-head-svc:6379"));
        assert_eq!(gpu["resources"]["requests"]["nvidia.com/gpu"], "1");
        let env = env_of(gpu);
        assert!(!env.iter().any(|(k, _)| k == "NVIDIA_VISIBLE_DEVICES"));
        assert!(env.contains(&("ASCEND_VISIBLE_DEVICES".into(), "void".into())));

        let npu = &ray["workerGroupSpecs"][1]["template"]["spec"]["containers"][0];
        assert!(npu["image"].as_str().unwrap().ends_with(":v1.0.0-ascend-910b"));
        let env = env_of(npu);
        assert!(env.contains(&("NVIDIA_VISIBLE_DEVICES".into(), "void".into())));
        assert!(!env.iter().any(|(k, _)| k == "ASCEND_VISIBLE_DEVICES"));
    }

    #[test]
    fn test_pull_secret_auth() {
        let cfg = k8s_config();
        let cluster = k8s_cluster(&cfg);
        let mut reg = registry("https://registry.example.com");
        reg.spec.authconfig = ImageRegistryAuth {
            username: "bot".into(),
            password: "s3cret".into(),
            ..Default::default()
        };
        let secret = Renderer::new(&cluster, &cfg, &reg).pull_secret().unwrap();
        assert_eq!(secret["type"], "kubernetes.io/dockerconfigjson");
        let raw = BASE64
            .decode(secret["data"][".dockerconfigjson"].as_str().unwrap())
            .unwrap();
        let parsed: Value = serde_json::from_slice(&raw).unwrap();
        let entry = &parsed["auths"]["registry.example.com"];
        assert_eq!(entry["username"], "bot");
        assert_eq!(entry["auth"], BASE64.encode("bot:s3cret"));
    }
}
