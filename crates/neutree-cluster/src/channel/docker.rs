use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::sync::OnceCell;

use neutree_common::DockerConfig;

use super::{shell_quote, ChannelError, CommandChannel, RunEnv, RunOptions, SshChannel};

/// Fraction of `MemAvailable` given to `/dev/shm` when the user sets none.
const SHM_RATIO_PERCENT: u64 = 11;

/// Runs commands inside the node's serving container, reached over SSH.
pub struct DockerChannel {
    ssh: SshChannel,
    docker: DockerConfig,
    home: OnceCell<String>,
}

/// `MemAvailable` of a `/proc/meminfo` dump, in bytes.
fn mem_available_bytes(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

impl DockerChannel {
    pub fn new(ssh: SshChannel, docker: DockerConfig) -> Self {
        Self {
            ssh,
            docker,
            home: OnceCell::new(),
        }
    }

    pub fn ssh(&self) -> &SshChannel {
        &self.ssh
    }

    pub fn container_name(&self) -> &str {
        &self.docker.container_name
    }

    fn resolve_env(cmd: &str, run_env: RunEnv) -> RunEnv {
        match run_env {
            RunEnv::Auto if cmd.is_empty() || cmd.starts_with("docker") => RunEnv::Host,
            RunEnv::Auto => RunEnv::Docker,
            other => other,
        }
    }

    async fn home(&self) -> Result<&str, ChannelError> {
        let home = self
            .home
            .get_or_try_init(|| async {
                let cmd = format!("docker exec {} printenv HOME", self.docker.container_name);
                let out = self
                    .ssh
                    .run(&cmd, &RunOptions::capture().exit_on_fail())
                    .await?;
                Ok::<_, ChannelError>(out.trim().to_string())
            })
            .await?;
        Ok(home.as_str())
    }

    /// `docker exec` wrapping of `cmd` for the container.
    pub fn wrap(&self, cmd: &str, opts: &RunOptions, home: &str) -> String {
        let cmd = cmd.replace("~/", &format!("{home}/"));
        let env: String = opts
            .env
            .iter()
            .map(|(k, v)| format!("-e {}={} ", k, shell_quote(v)))
            .collect();
        format!(
            "docker exec {env}{} /bin/bash -c {}",
            self.docker.container_name,
            shell_quote(&cmd)
        )
    }

    async fn host_output(&self, cmd: &str) -> anyhow::Result<String> {
        Ok(self
            .ssh
            .run(cmd, &RunOptions::capture().on(RunEnv::Host))
            .await?)
    }

    pub async fn is_running(&self) -> anyhow::Result<bool> {
        let out = self
            .host_output(&format!(
                "docker inspect -f '{{{{.State.Running}}}}' {} 2>/dev/null || true",
                self.docker.container_name
            ))
            .await?;
        Ok(out.trim() == "true")
    }

    async fn gpu_runtime_available(&self) -> anyhow::Result<bool> {
        let info = self.host_output("docker info 2>/dev/null || true").await?;
        if !info.contains("nvidia-container-runtime") {
            return Ok(false);
        }
        Ok(self
            .ssh
            .run("nvidia-smi", &RunOptions::default().on(RunEnv::Host))
            .await
            .is_ok())
    }

    /// Ensures the serving container is running on the node.
    pub async fn run_init(&self) -> anyhow::Result<()> {
        let ip = self.ssh.ip().to_string();
        let image = &self.docker.image;

        let probe = self
            .host_output("command -v docker || echo 'NoExist'")
            .await
            .with_context(|| format!("probe docker on {ip}"))?;
        if probe.contains("NoExist") {
            bail!("docker is not installed on {ip}");
        }

        let pull = if self.docker.pull_before_run {
            format!("docker pull {image}")
        } else {
            format!("docker image inspect {image} 1> /dev/null 2>&1 || docker pull {image}")
        };
        self.ssh
            .run(&pull, &RunOptions::default().on(RunEnv::Host).exit_on_fail())
            .await
            .with_context(|| format!("pull {image} on {ip}"))?;

        if self.is_running().await? {
            tracing::debug!(node = %ip, container = %self.docker.container_name, "container already running");
            return Ok(());
        }

        let mut user_opts: Vec<String> = Vec::new();
        for o in self
            .docker
            .run_options
            .iter()
            .chain(self.docker.worker_run_options.iter())
        {
            if !user_opts.contains(o) {
                user_opts.push(o.clone());
            }
        }
        if !user_opts.iter().any(|o| o.contains("--shm-size")) {
            let meminfo = self.host_output("cat /proc/meminfo").await?;
            if let Some(avail) = mem_available_bytes(&meminfo) {
                user_opts.push(format!("--shm-size={}b", avail * SHM_RATIO_PERCENT / 100));
            }
        }
        if self.gpu_runtime_available().await? {
            user_opts.push("--runtime=nvidia".into());
            user_opts.push("--gpus all".into());
        }

        let mut run = format!(
            "docker run --rm --name {} -d -it -e LC_ALL=C.UTF-8 -e LANG=C.UTF-8",
            self.docker.container_name
        );
        for o in &user_opts {
            run.push(' ');
            run.push_str(o);
        }
        run.push_str(&format!(" --net=host {image} bash"));

        self.ssh
            .run(&run, &RunOptions::default().on(RunEnv::Host).exit_on_fail())
            .await
            .with_context(|| format!("start container {} on {ip}", self.docker.container_name))?;
        tracing::info!(node = %ip, container = %self.docker.container_name, image = %image, "container started");
        Ok(())
    }
}

#[async_trait]
impl CommandChannel for DockerChannel {
    async fn run(&self, cmd: &str, opts: &RunOptions) -> Result<String, ChannelError> {
        match Self::resolve_env(cmd, opts.run_env) {
            RunEnv::Docker => {
                let home = self.home().await?.to_string();
                let wrapped = self.wrap(cmd, opts, &home);
                let host_opts = RunOptions {
                    env: Default::default(),
                    run_env: RunEnv::Host,
                    ..opts.clone()
                };
                self.ssh.run(&wrapped, &host_opts).await
            }
            _ => self.ssh.run(cmd, opts).await,
        }
    }

    fn target(&self) -> &str {
        self.ssh.ip()
    }
}
