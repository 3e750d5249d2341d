use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;

use neutree_common::cluster::default_container_name;
use neutree_common::{
    AcceleratorType, Cluster, DockerConfig, Endpoint, ImageRegistry, ModelRegistry,
    SshClusterConfig,
};

use super::{
    connect_model, disconnect_model, ClusterManager, ManagerOptions, DASHBOARD_PORT, GCS_PORT,
    SERVE_PORT,
};
use crate::channel::{CommandChannel, DockerChannel, RunEnv, RunOptions, SshChannel};
use crate::config::ConfigManager;
use crate::dashboard::{DashboardClient, DashboardError};
use crate::deps::{serve_image, validate_images};

const DRAIN_DEADLINE_SECS: u64 = 600;

#[derive(Debug, Serialize)]
struct NodeState {
    tags: BTreeMap<String, String>,
    state: String,
}

/// Manager for clusters provisioned over SSH with the runtime's launcher.
pub struct SshClusterManager {
    name: String,
    version: String,
    registry: ImageRegistry,
    config: SshClusterConfig,
    config_manager: ConfigManager,
    opts: ManagerOptions,
    dashboard: DashboardClient,
}

impl SshClusterManager {
    /// Validates the serving image and materialises the bootstrap files.
    pub async fn new(
        cluster: &Cluster,
        registry: ImageRegistry,
        opts: ManagerOptions,
    ) -> anyhow::Result<Self> {
        let mut config = cluster.ssh_config()?;
        let name = cluster.metadata.name.clone();
        config.cluster_name = name.clone();
        let docker = config.docker.get_or_insert_with(|| DockerConfig {
            container_name: default_container_name(),
            ..Default::default()
        });
        docker.image = serve_image(&registry, &cluster.spec.version, AcceleratorType::None);
        let image = docker.image.clone();

        validate_images(&registry, &[image])
            .await
            .with_context(|| format!("validate dependencies of cluster {}", cluster.key()))?;

        let config_manager = ConfigManager::new(&opts.tmp_dir, &name)
            .with_context(|| format!("create work dir for cluster {name}"))?;
        config_manager.generate(&config)?;

        let dashboard = DashboardClient::with_timeout(
            format!("http://{}:{DASHBOARD_PORT}", config.provider.head_ip),
            opts.dashboard_timeout,
        )?;

        let mut manager = Self {
            name,
            version: cluster.spec.version.clone(),
            registry,
            config,
            config_manager,
            opts,
            dashboard,
        };

        let head = manager.config.provider.head_ip.clone();
        let accelerator = manager.detect_accelerator(&head).await;
        if accelerator.is_ascend() {
            let image = serve_image(&manager.registry, &manager.version, accelerator);
            validate_images(&manager.registry, &[image.clone()]).await?;
            if let Some(docker) = manager.config.docker.as_mut() {
                docker.image = image;
            }
            manager.config_manager.regenerate(&manager.config)?;
            tracing::info!(cluster = %manager.name, %accelerator, "head accelerator detected, image retagged");
        }

        if cluster.is_initialized() {
            manager.ensure_state_file()?;
        }
        Ok(manager)
    }

    pub fn state_file(&self) -> PathBuf {
        self.opts
            .tmp_dir
            .join("ray")
            .join(format!("cluster-{}.state", self.name))
    }

    pub fn config_manager(&self) -> &ConfigManager {
        &self.config_manager
    }

    #[cfg(test)]
    pub(crate) fn set_dashboard(&mut self, dashboard: DashboardClient) {
        self.dashboard = dashboard;
    }

    /// Records the head as running so the launcher treats the cluster as up.
    fn ensure_state_file(&self) -> anyhow::Result<()> {
        let path = self.state_file();
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let head = NodeState {
            tags: BTreeMap::from([
                ("ray-node-type".to_string(), "head".to_string()),
                ("ray-node-status".to_string(), "up-to-date".to_string()),
            ]),
            state: "running".to_string(),
        };
        let body = serde_json::to_vec(&BTreeMap::from([(
            self.config.provider.head_ip.clone(),
            head,
        )]))?;
        std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    fn ssh_channel(&self, ip: &str) -> SshChannel {
        SshChannel::new(
            self.opts.executor.clone(),
            &self.opts.tmp_dir,
            &self.name,
            self.config.auth.ssh_user.clone(),
            ip,
            self.config_manager.ssh_key_path(),
        )
    }

    fn docker_channel(&self, ip: &str, image: Option<String>) -> DockerChannel {
        let mut docker = self.config.docker.clone().unwrap_or_default();
        if let Some(image) = image {
            docker.image = image;
        }
        DockerChannel::new(self.ssh_channel(ip), docker)
    }

    async fn detect_accelerator(&self, ip: &str) -> AcceleratorType {
        let ssh = self.ssh_channel(ip);
        let host = RunOptions::capture().on(RunEnv::Host);
        let nvidia_ok = ssh.run("nvidia-smi", &host).await.is_ok();
        let npu = if nvidia_ok {
            None
        } else {
            ssh.run("npu-smi info", &host).await.ok()
        };
        AcceleratorType::from_probes(nvidia_ok, npu.as_deref())
    }

    async fn run_ray(&self, args: Vec<String>) -> anyhow::Result<Vec<u8>> {
        Ok(self
            .opts
            .executor
            .execute(&self.opts.ray_binary, &args)
            .await?)
    }

    fn head_ip(&self) -> &str {
        &self.config.provider.head_ip
    }
}

#[async_trait]
impl ClusterManager for SshClusterManager {
    async fn up_cluster(&self, restart: bool) -> anyhow::Result<String> {
        let mut args = vec![
            "up".to_string(),
            self.config_manager.config_path().display().to_string(),
            "--disable-usage-stats".into(),
            "--no-config-cache".into(),
            "-y".into(),
            "-v".into(),
        ];
        if !restart {
            args.push("--no-restart".into());
        }
        self.run_ray(args)
            .await
            .with_context(|| format!("up cluster {}", self.name))?;
        tracing::info!(cluster = %self.name, head = %self.head_ip(), restart, "cluster up");
        Ok(self.head_ip().to_string())
    }

    async fn down_cluster(&self) -> anyhow::Result<()> {
        let workers = &self.config.provider.worker_ips;
        let results = join_all(workers.iter().map(|ip| self.stop_node(ip))).await;
        for (ip, res) in workers.iter().zip(results) {
            if let Err(e) = res {
                tracing::warn!(cluster = %self.name, node = %ip, error = %e, "stop worker failed, continuing");
            }
        }

        self.run_ray(vec![
            "down".into(),
            "-y".into(),
            "-v".into(),
            self.config_manager.config_path().display().to_string(),
        ])
        .await
        .with_context(|| format!("down cluster {}", self.name))?;

        match std::fs::remove_file(self.state_file()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.config_manager.purge()?;
        tracing::info!(cluster = %self.name, "cluster down");
        Ok(())
    }

    /// Starts configured static workers that the dashboard does not report alive.
    async fn sync(&self) -> anyhow::Result<()> {
        let alive: Vec<String> = self
            .dashboard
            .alive_nodes()
            .await
            .context("list alive nodes")?
            .into_iter()
            .map(|n| n.ip)
            .collect();
        for ip in self.desired_static_workers_ip() {
            if alive.contains(&ip) {
                continue;
            }
            tracing::info!(cluster = %self.name, node = %ip, "static worker missing, starting");
            self.start_node(&ip).await?;
        }
        Ok(())
    }

    async fn start_node(&self, ip: &str) -> anyhow::Result<()> {
        let accelerator = self.detect_accelerator(ip).await;
        let image = serve_image(&self.registry, &self.version, accelerator);
        validate_images(&self.registry, &[image.clone()])
            .await
            .with_context(|| format!("validate image for node {ip}"))?;

        let channel = self.docker_channel(ip, Some(image));
        let env = RunOptions::default()
            .env("RAY_HEAD_IP", self.head_ip())
            .exit_on_fail();

        for cmd in &self.config.initialization_commands {
            channel
                .run(cmd, &env.clone().on(RunEnv::Host))
                .await
                .with_context(|| format!("initialization command on {ip}"))?;
        }
        channel
            .run_init()
            .await
            .with_context(|| format!("start container on {ip}"))?;
        for cmd in &self.config.static_worker_start_ray_commands {
            channel
                .run(cmd, &env.clone().on(RunEnv::Docker))
                .await
                .with_context(|| format!("start worker on {ip}"))?;
        }
        tracing::info!(cluster = %self.name, node = %ip, %accelerator, "node started");
        Ok(())
    }

    async fn stop_node(&self, ip: &str) -> anyhow::Result<()> {
        let node = match self.dashboard.node_by_ip(ip).await {
            Ok(n) => n,
            Err(DashboardError::NotFound(_)) => {
                tracing::debug!(cluster = %self.name, node = %ip, "node unknown to dashboard");
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("look up node {ip}")),
        };

        if node.is_alive() {
            self.run_ray(vec![
                "drain-node".into(),
                format!("--address={}:{GCS_PORT}", self.head_ip()),
                "--node-id".into(),
                node.raylet.node_id.clone(),
                "--reason".into(),
                "DRAIN_NODE_REASON_PREEMPTION".into(),
                "--reason-message".into(),
                format!("stopping node {ip}"),
                "--deadline-remaining-seconds".into(),
                DRAIN_DEADLINE_SECS.to_string(),
            ])
            .await
            .with_context(|| format!("drain node {ip}"))?;
        }

        let channel = self.docker_channel(ip, None);
        if !channel.is_running().await? {
            return Ok(());
        }
        channel
            .run("ray stop", &RunOptions::default().on(RunEnv::Docker).exit_on_fail())
            .await
            .with_context(|| format!("ray stop on {ip}"))?;
        channel
            .run(
                &format!("docker stop {}", channel.container_name()),
                &RunOptions::default().on(RunEnv::Host).exit_on_fail(),
            )
            .await
            .with_context(|| format!("stop container on {ip}"))?;
        tracing::info!(cluster = %self.name, node = %ip, "node stopped");
        Ok(())
    }

    async fn connect_endpoint_model(
        &self,
        endpoint: &Endpoint,
        model_registry: &ModelRegistry,
    ) -> anyhow::Result<()> {
        for node in self.dashboard.alive_nodes().await? {
            let channel = self.docker_channel(&node.ip, None);
            connect_model(&channel, endpoint, model_registry)
                .await
                .with_context(|| format!("connect model on {}", node.ip))?;
        }
        Ok(())
    }

    async fn disconnect_endpoint_model(
        &self,
        endpoint: &Endpoint,
        model_registry: &ModelRegistry,
    ) -> anyhow::Result<()> {
        for node in self.dashboard.alive_nodes().await? {
            let channel = self.docker_channel(&node.ip, None);
            if let Err(e) = disconnect_model(&channel, endpoint, model_registry).await {
                tracing::warn!(node = %node.ip, error = %e, "disconnect model failed");
            }
        }
        Ok(())
    }

    async fn dashboard_service(&self) -> anyhow::Result<String> {
        Ok(format!("http://{}:{DASHBOARD_PORT}", self.head_ip()))
    }

    async fn serve_endpoint(&self) -> anyhow::Result<String> {
        Ok(format!("http://{}:{SERVE_PORT}", self.head_ip()))
    }

    fn desired_static_workers_ip(&self) -> Vec<String> {
        self.config.provider.worker_ips.clone()
    }
}
