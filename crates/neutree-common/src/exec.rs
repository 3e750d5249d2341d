use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {exit_code}: {output}")]
    Exit {
        program: String,
        exit_code: i32,
        output: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

impl ExecError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Exit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Captured stdout+stderr, empty if the process never ran to completion.
    pub fn output(&self) -> &str {
        match self {
            ExecError::Exit { output, .. } => output,
            _ => "",
        }
    }
}

/// Runs an external program and returns its combined output.
///
/// Dropping the returned future terminates the child process, so callers
/// cancel by dropping (e.g. through `tokio::time::timeout` or `select!`).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>, ExecError>;

    async fn execute_timeout(
        &self,
        timeout: Duration,
        program: &str,
        args: &[String],
    ) -> Result<Vec<u8>, ExecError> {
        match tokio::time::timeout(timeout, self.execute(program, args)).await {
            Ok(res) => res,
            Err(_) => Err(ExecError::Timeout {
                program: program.to_string(),
                timeout,
            }),
        }
    }
}

/// Executor backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>, ExecError> {
        tracing::debug!(%program, args = ?args, "exec");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ExecError::Exit {
                program: program.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                output: String::from_utf8_lossy(&combined).into_owned(),
            })
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{ExecError, Executor};

    enum Reply {
        Output(Vec<u8>),
        Fail(i32, String),
    }

    /// Records every command line and answers from substring rules. Rules
    /// added later take precedence; unmatched commands succeed with no output.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        calls: Mutex<Vec<String>>,
        rules: Mutex<Vec<(String, Reply)>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, pattern: &str, output: &str) -> &Self {
            self.rules
                .lock()
                .unwrap()
                .push((pattern.to_string(), Reply::Output(output.as_bytes().to_vec())));
            self
        }

        pub fn fail(&self, pattern: &str, exit_code: i32, output: &str) -> &Self {
            self.rules
                .lock()
                .unwrap()
                .push((pattern.to_string(), Reply::Fail(exit_code, output.to_string())));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.contains(pattern))
                .collect()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>, ExecError> {
            let line = std::iter::once(program.to_string())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().unwrap().push(line.clone());

            let rules = self.rules.lock().unwrap();
            for (pattern, reply) in rules.iter().rev() {
                if line.contains(pattern.as_str()) {
                    return match reply {
                        Reply::Output(out) => Ok(out.clone()),
                        Reply::Fail(code, out) => Err(ExecError::Exit {
                            program: program.to_string(),
                            exit_code: *code,
                            output: out.clone(),
                        }),
                    };
                }
            }
            Ok(Vec::new())
        }
    }
}
