use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::io::AsyncReadExt;

use super::{export_prefix, ChannelError, CommandChannel, RunOptions, IDLE_COMMAND};

/// Builds a client from a base64-encoded kubeconfig.
pub async fn client_from_kubeconfig(kubeconfig_b64: &str) -> anyhow::Result<Client> {
    let raw = BASE64
        .decode(kubeconfig_b64.trim())
        .context("decode kubeconfig")?;
    let yaml = String::from_utf8(raw).context("kubeconfig is not UTF-8")?;
    let kubeconfig = Kubeconfig::from_yaml(&yaml).context("parse kubeconfig")?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("load kubeconfig")?;
    Ok(Client::try_from(config)?)
}

/// What one exec into a container produced.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the server closed the stream without reporting one.
    pub status: Option<Status>,
}

/// Runs a command in a pod container and collects its streams.
#[async_trait]
pub trait PodAttach: Send + Sync {
    async fn exec(&self, pod: &str, container: &str, command: &[&str]) -> Result<ExecOutput, ChannelError>;
}

#[async_trait]
impl PodAttach for Api<Pod> {
    async fn exec(&self, pod: &str, container: &str, command: &[&str]) -> Result<ExecOutput, ChannelError> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut proc = Api::exec(self, pod, command.iter().copied(), &params).await?;

        let mut stdout = proc.stdout();
        let mut stderr = proc.stderr();
        let status = proc.take_status();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_out = async {
            if let Some(s) = stdout.as_mut() {
                s.read_to_end(&mut out).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(s) = stderr.as_mut() {
                s.read_to_end(&mut err).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (r1, r2) = tokio::join!(read_out, read_err);
        r1?;
        r2?;

        let status = match status {
            Some(fut) => fut.await,
            None => None,
        };
        if let Err(e) = proc.join().await {
            tracing::debug!(%pod, error = %e, "exec stream closed with error");
        }
        Ok(ExecOutput {
            stdout: out,
            stderr: err,
            status,
        })
    }
}

/// Exec channel into one container of a pod.
pub struct PodChannel {
    attach: Arc<dyn PodAttach>,
    pod: String,
    container: String,
}

impl PodChannel {
    pub fn new(client: Client, namespace: &str, pod: impl Into<String>, container: impl Into<String>) -> Self {
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        Self::with_attach(Arc::new(pods), pod, container)
    }

    pub fn with_attach(
        attach: Arc<dyn PodAttach>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            attach,
            pod: pod.into(),
            container: container.into(),
        }
    }

    pub async fn from_kubeconfig(
        kubeconfig_b64: &str,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> anyhow::Result<Self> {
        let client = client_from_kubeconfig(kubeconfig_b64).await?;
        Ok(Self::new(client, namespace, pod, container))
    }

    fn command_line(cmd: &str, opts: &RunOptions) -> String {
        if cmd.is_empty() {
            IDLE_COMMAND.to_string()
        } else {
            format!("{}{cmd}", export_prefix(&opts.env))
        }
    }
}

#[async_trait]
impl CommandChannel for PodChannel {
    async fn run(&self, cmd: &str, opts: &RunOptions) -> Result<String, ChannelError> {
        let line = Self::command_line(cmd, opts);
        let ExecOutput {
            stdout: mut out,
            stderr,
            status,
        } = self
            .attach
            .exec(&self.pod, &self.container, &["/bin/bash", "-c", line.as_str()])
            .await?;

        out.extend_from_slice(&stderr);
        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map(|s| s == "Success")
            .unwrap_or(true);
        if !success {
            let reason = status.and_then(|s| s.message).unwrap_or_default();
            let message = if opts.exit_on_fail {
                format!("{line}: {reason}")
            } else {
                format!("{reason}\n{}", String::from_utf8_lossy(&out))
            };
            return Err(ChannelError::Pod {
                pod: self.pod.clone(),
                message,
            });
        }

        if opts.capture_output {
            Ok(String::from_utf8_lossy(&out).into_owned())
        } else {
            Ok(String::new())
        }
    }

    fn target(&self) -> &str {
        &self.pod
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_command_line() {
        assert_eq!(PodChannel::command_line("", &RunOptions::default()), IDLE_COMMAND);
        let opts = RunOptions::default().env("A", "1");
        assert_eq!(PodChannel::command_line("mount", &opts), "export A=1;mount");
    }

    /// Replays one canned exec result and records what was run.
    struct CannedExec {
        stdout: &'static str,
        stderr: &'static str,
        status: Option<Status>,
        calls: Mutex<Vec<(String, String, Vec<String>)>>,
    }

    impl CannedExec {
        fn new(stdout: &'static str, stderr: &'static str, status: Option<Status>) -> Arc<Self> {
            Arc::new(Self {
                stdout,
                stderr,
                status,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PodAttach for CannedExec {
        async fn exec(&self, pod: &str, container: &str, command: &[&str]) -> Result<ExecOutput, ChannelError> {
            self.calls.lock().unwrap().push((
                pod.to_string(),
                container.to_string(),
                command.iter().map(|c| c.to_string()).collect(),
            ));
            Ok(ExecOutput {
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: self.stderr.as_bytes().to_vec(),
                status: self.status.clone(),
            })
        }
    }

    fn status(outcome: &str, message: &str) -> Option<Status> {
        Some(Status {
            status: Some(outcome.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_run_captures_stdout_and_stderr() {
        let exec = CannedExec::new("mounted\n", "warning: slow\n", status("Success", ""));
        let ch = PodChannel::with_attach(exec.clone(), "prod-head-x", "ray-head");

        let out = ch
            .run("mount", &RunOptions::capture().env("A", "1"))
            .await
            .unwrap();
        assert_eq!(out, "mounted\nwarning: slow\n");
        assert_eq!(ch.run("true", &RunOptions::default()).await.unwrap(), "");

        let calls = exec.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "prod-head-x");
        assert_eq!(calls[0].1, "ray-head");
        assert_eq!(calls[0].2, ["/bin/bash", "-c", "export A=1;mount"]);
    }

    #[tokio::test]
    async fn test_run_without_status_is_success() {
        let exec = CannedExec::new("ok", "", None);
        let ch = PodChannel::with_attach(exec, "p", "c");
        assert_eq!(ch.run("x", &RunOptions::capture()).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_run_failure_folds_stderr_into_error() {
        let reason = "command terminated with non-zero exit code: exit status 32";
        let exec = CannedExec::new("", "mount.nfs: access denied\n", status("Failure", reason));
        let ch = PodChannel::with_attach(exec, "prod-head-x", "ray-head");

        let err = ch.run("mount -t nfs a:/b /mnt", &RunOptions::capture()).await.unwrap_err();
        let ChannelError::Pod { pod, message } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(pod, "prod-head-x");
        assert!(message.contains(reason));
        assert!(message.contains("mount.nfs: access denied"));

        let err = ch
            .run("mount -t nfs a:/b /mnt", &RunOptions::capture().exit_on_fail())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("mount -t nfs a:/b /mnt"), "{msg}");
        assert!(msg.contains(reason), "{msg}");
    }

    #[tokio::test]
    async fn test_invalid_kubeconfig() {
        let err = client_from_kubeconfig("%%%").await.err().expect("expected error");
        assert!(err.to_string().contains("decode kubeconfig"));
    }
}
