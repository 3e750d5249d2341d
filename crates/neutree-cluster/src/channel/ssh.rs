use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use neutree_common::Executor;

use super::{export_prefix, ChannelError, CommandChannel, RunOptions, IDLE_COMMAND};

const SSH_BINARY: &str = "ssh";

/// Control socket directory shared by every channel of one cluster.
pub fn control_dir(tmp_dir: &Path, cluster_name: &str) -> PathBuf {
    let hash = format!("{:x}", Sha256::digest(cluster_name.as_bytes()));
    tmp_dir.join(format!("neutree_ssh_{}", &hash[..10]))
}

/// One SSH target `(user, ip, key)` of a named cluster.
pub struct SshChannel {
    executor: Arc<dyn Executor>,
    user: String,
    ip: String,
    key_path: PathBuf,
    control_dir: Option<PathBuf>,
}

impl SshChannel {
    /// An empty `cluster_name` disables connection sharing.
    pub fn new(
        executor: Arc<dyn Executor>,
        tmp_dir: &Path,
        cluster_name: &str,
        user: impl Into<String>,
        ip: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            user: user.into(),
            ip: ip.into(),
            key_path: key_path.into(),
            control_dir: (!cluster_name.is_empty()).then(|| control_dir(tmp_dir, cluster_name)),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    fn connection_options(&self, key: &Path) -> Vec<String> {
        let mut opts: Vec<String> = [
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "IdentitiesOnly=yes",
            "ExitOnForwardFailure=yes",
            "ServerAliveInterval=5",
            "ServerAliveCountMax=3",
        ]
        .iter()
        .flat_map(|o| ["-o".to_string(), o.to_string()])
        .collect();

        if let Some(dir) = &self.control_dir {
            for o in [
                "ControlMaster=auto".to_string(),
                format!("ControlPath={}/%C", dir.display()),
                "ControlPersist=10s".to_string(),
            ] {
                opts.push("-o".into());
                opts.push(o);
            }
        }
        opts.push("-i".into());
        opts.push(key.display().to_string());
        opts
    }

    /// Full `ssh` argument list for `cmd`.
    pub fn build_args(&self, cmd: &str, opts: &RunOptions) -> Vec<String> {
        let mut args = Vec::new();
        for (local, remote) in &opts.port_forwards {
            args.push("-L".to_string());
            args.push(format!("{local}:localhost:{remote}"));
        }
        let key = opts.override_key.as_deref().unwrap_or(&self.key_path);
        args.extend(self.connection_options(key));
        args.push(format!("{}@{}", self.user, self.ip));

        let mut remote = if cmd.is_empty() {
            IDLE_COMMAND.to_string()
        } else {
            format!("{}{cmd}", export_prefix(&opts.env))
        };
        if opts.shutdown_after {
            remote.push_str("; sudo shutdown -h now");
        }
        args.push(remote);
        args
    }

    fn ensure_control_dir(&self) -> std::io::Result<()> {
        let Some(dir) = &self.control_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn run(&self, cmd: &str, opts: &RunOptions) -> Result<String, ChannelError> {
        self.ensure_control_dir()?;
        let args = self.build_args(cmd, opts);
        tracing::debug!(target_ip = %self.ip, cmd = %cmd, "ssh run");

        match self.executor.execute(SSH_BINARY, &args).await {
            Ok(out) if opts.capture_output => Ok(String::from_utf8_lossy(&out).into_owned()),
            Ok(_) => Ok(String::new()),
            Err(source) if opts.exit_on_fail => Err(ChannelError::Command {
                command: format!("{SSH_BINARY} {}", args.join(" ")),
                source,
            }),
            Err(source) => Err(ChannelError::Failed {
                output: source.output().to_string(),
                source,
            }),
        }
    }

    fn target(&self) -> &str {
        &self.ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutree_common::exec::testing::ScriptedExecutor;

    fn channel(exec: Arc<ScriptedExecutor>, tmp: &Path, cluster: &str) -> SshChannel {
        SshChannel::new(exec, tmp, cluster, "ubuntu", "10.0.0.2", "/keys/id")
    }

    #[tokio::test]
    async fn test_empty_command_runs_idle_command() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let ch = channel(exec.clone(), tmp.path(), "");

        ch.run("", &RunOptions::default()).await.unwrap();
        let args = ch.build_args("", &RunOptions::default());
        assert_eq!(args.last().unwrap(), IDLE_COMMAND);
        assert!(exec.calls()[0].starts_with("ssh "));
        assert!(!args.iter().any(|a| a.starts_with("ControlMaster")));
    }

    #[tokio::test]
    async fn test_control_socket_and_forwards() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let ch = channel(exec, tmp.path(), "prod");

        let opts = RunOptions {
            port_forwards: vec![(8265, 8265)],
            shutdown_after: true,
            ..RunOptions::default().env("RAY_HEAD_IP", "10.0.0.1")
        };
        let args = ch.build_args("ray status", &opts);
        assert_eq!(&args[..2], ["-L", "8265:localhost:8265"]);
        let dir = control_dir(tmp.path(), "prod");
        assert!(args.contains(&format!("ControlPath={}/%C", dir.display())));
        assert!(args.contains(&"ControlPersist=10s".to_string()));
        assert!(args.contains(&"ubuntu@10.0.0.2".to_string()));
        assert_eq!(
            args.last().unwrap(),
            "export RAY_HEAD_IP=10.0.0.1;ray status; sudo shutdown -h now"
        );

        ch.run("true", &RunOptions::default()).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_control_dir_is_stable() {
        let a = control_dir(Path::new("/tmp"), "prod");
        assert_eq!(a, control_dir(Path::new("/tmp"), "prod"));
        assert_ne!(a, control_dir(Path::new("/tmp"), "staging"));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), "neutree_ssh_".len() + 10);
    }

    #[tokio::test]
    async fn test_failure_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.fail("false", 1, "boom");
        let ch = channel(exec, tmp.path(), "");

        let err = ch.run("false", &RunOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "SSH command failed.\nboom");

        let err = ch
            .run("false", &RunOptions::default().exit_on_fail())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("command failed: ssh "));
        assert!(msg.ends_with("ubuntu@10.0.0.2 false"));
    }

    #[tokio::test]
    async fn test_capture_output() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("hostname", "node-a\n");
        let ch = channel(exec, tmp.path(), "");

        assert_eq!(ch.run("hostname", &RunOptions::capture()).await.unwrap(), "node-a\n");
        assert_eq!(ch.run("hostname", &RunOptions::default()).await.unwrap(), "");
    }
}
