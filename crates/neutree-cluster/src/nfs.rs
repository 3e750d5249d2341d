use anyhow::Context;

use crate::channel::{shell_quote, CommandChannel, RunEnv, RunOptions};

/// Mounts NFS exports through a command channel. Both operations are
/// idempotent.
pub struct NfsMounter<'a> {
    channel: &'a dyn CommandChannel,
}

impl<'a> NfsMounter<'a> {
    pub fn new(channel: &'a dyn CommandChannel) -> Self {
        Self { channel }
    }

    fn opts() -> RunOptions {
        RunOptions::capture().on(RunEnv::Docker)
    }

    /// Source currently mounted at `target`, if any.
    async fn mounted_source(&self, target: &str) -> anyhow::Result<Option<String>> {
        let out = self
            .channel
            .run(
                &format!("findmnt -n -o SOURCE --mountpoint {} || true", shell_quote(target)),
                &Self::opts(),
            )
            .await?;
        let source = out.trim();
        Ok((!source.is_empty()).then(|| source.to_string()))
    }

    pub async fn mount(&self, source: &str, target: &str) -> anyhow::Result<()> {
        let node = self.channel.target().to_string();
        if let Some(current) = self.mounted_source(target).await? {
            if current == source {
                tracing::debug!(%node, %source, %target, "nfs already mounted");
                return Ok(());
            }
        }
        let cmd = format!(
            "mkdir -p {t} && mount -t nfs {s} {t}",
            s = shell_quote(source),
            t = shell_quote(target)
        );
        self.channel
            .run(&cmd, &Self::opts().exit_on_fail())
            .await
            .with_context(|| format!("mount {source} at {target} on {node}"))?;
        tracing::info!(%node, %source, %target, "nfs mounted");
        Ok(())
    }

    pub async fn unmount(&self, target: &str) -> anyhow::Result<()> {
        let node = self.channel.target().to_string();
        if self.mounted_source(target).await?.is_none() {
            return Ok(());
        }
        self.channel
            .run(&format!("umount {}", shell_quote(target)), &Self::opts().exit_on_fail())
            .await
            .with_context(|| format!("unmount {target} on {node}"))?;
        tracing::info!(%node, %target, "nfs unmounted");
        Ok(())
    }
}
