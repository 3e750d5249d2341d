//! "Run a command somewhere": over SSH, inside a node's container, or in a pod.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use neutree_common::ExecError;

pub mod docker;
pub mod pod;
pub mod ssh;

pub use docker::DockerChannel;
pub use pod::{ExecOutput, PodAttach, PodChannel};
pub use ssh::SshChannel;

/// Remote command run by an empty `run` call.
pub const IDLE_COMMAND: &str = "while true; do sleep 86400; done";

/// Where a command executes on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunEnv {
    Host,
    Docker,
    /// Host for empty and `docker …` commands, the container otherwise.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub exit_on_fail: bool,
    /// `(local, remote)` ports forwarded with `-L`.
    pub port_forwards: Vec<(u16, u16)>,
    pub capture_output: bool,
    pub env: BTreeMap<String, String>,
    pub run_env: RunEnv,
    /// Identity file used instead of the channel's key.
    pub override_key: Option<PathBuf>,
    pub shutdown_after: bool,
}

impl RunOptions {
    pub fn capture() -> Self {
        Self {
            capture_output: true,
            ..Default::default()
        }
    }

    pub fn on(mut self, run_env: RunEnv) -> Self {
        self.run_env = run_env;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn exit_on_fail(mut self) -> Self {
        self.exit_on_fail = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Raised under `exit_on_fail`; carries the full command line.
    #[error("command failed: {command}")]
    Command {
        command: String,
        #[source]
        source: ExecError,
    },

    #[error("SSH command failed.\n{output}")]
    Failed {
        output: String,
        #[source]
        source: ExecError,
    },

    #[error("exec in pod {pod} failed: {message}")]
    Pod { pod: String, message: String },

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Runs `cmd`, returning its output when `capture_output` is set and an
    /// empty string otherwise.
    async fn run(&self, cmd: &str, opts: &RunOptions) -> Result<String, ChannelError>;

    /// Address of the node the channel reaches, for logs.
    fn target(&self) -> &str;
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// `export K=V;` for every entry, ready to prefix a command.
pub(crate) fn export_prefix(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("export {k}={};", shell_quote(v)))
        .collect()
}
