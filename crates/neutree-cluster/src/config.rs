use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use neutree_common::SshClusterConfig;

const BOOTSTRAP_FILE: &str = "bootstrap.yaml";
const SSH_KEY_FILE: &str = "ssh_private_key";

/// Private per-cluster directory holding the bootstrap config handed to the
/// runtime's launcher and the decoded SSH key.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    base_dir: PathBuf,
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn write_private(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(body)?;
    set_mode(path, 0o600)
}

impl ConfigManager {
    /// Creates `<tmp_dir>/ray_cluster/<cluster_name>` with mode 0700.
    pub fn new(tmp_dir: &Path, cluster_name: &str) -> std::io::Result<Self> {
        let base_dir = tmp_dir.join("ray_cluster").join(cluster_name);
        std::fs::create_dir_all(&base_dir)?;
        set_mode(&base_dir, 0o700)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(BOOTSTRAP_FILE)
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.base_dir.join(SSH_KEY_FILE)
    }

    /// Writes the key and bootstrap config, leaving existing files alone.
    pub fn generate(&self, config: &SshClusterConfig) -> anyhow::Result<()> {
        let key_path = self.ssh_key_path();
        if !key_path.exists() {
            let key = BASE64
                .decode(config.auth.ssh_private_key.trim())
                .context("decode ssh private key")?;
            write_private(&key_path, &key)
                .with_context(|| format!("write {}", key_path.display()))?;
        }

        let config_path = self.config_path();
        if config_path.exists() {
            return Ok(());
        }
        // deep copy through JSON so the caller's config stays untouched
        let mut bootstrap: SshClusterConfig =
            serde_json::from_value(serde_json::to_value(config)?)?;
        bootstrap.provider.worker_ips.clear();
        bootstrap.auth.ssh_private_key = key_path.display().to_string();
        let yaml = serde_yaml::to_string(&bootstrap)?;
        write_private(&config_path, yaml.as_bytes())
            .with_context(|| format!("write {}", config_path.display()))?;
        tracing::debug!(path = %config_path.display(), "bootstrap config written");
        Ok(())
    }

    /// Rewrites the bootstrap config, e.g. after the image tag changed.
    pub fn regenerate(&self, config: &SshClusterConfig) -> anyhow::Result<()> {
        let path = self.config_path();
        if path.exists() {
            std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
        self.generate(config)
    }

    /// Removes the whole directory.
    pub fn purge(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.base_dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
