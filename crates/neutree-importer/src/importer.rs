//! Extract → parse manifest → validate → load → push → register engines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;

use neutree_common::{Engine, EngineSpec, EngineVersion, Executor, Metadata};
use neutree_meta::{MetaStore, ResourceStore};
use neutree_registry::{Credentials, RegistryClient};

use crate::error::ImportError;
use crate::extract::extract_archive;
use crate::manifest::{EngineMetadata, PackageManifest};

pub const DEFAULT_PUSH_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub package_path: PathBuf,
    pub workspace: String,
    /// Name of an ImageRegistry record in `workspace` to push to.
    pub image_registry: Option<String>,
    /// Inline push target, used with `registry_user`/`registry_password`.
    pub mirror_registry: Option<String>,
    pub registry_user: Option<String>,
    pub registry_password: Option<String>,
    pub skip_image_load: bool,
    pub skip_image_push: bool,
    /// Replace engine versions that already exist.
    pub force: bool,
    /// Extract here and keep the tree; a temporary directory otherwise.
    pub extract_dir: Option<PathBuf>,
    pub push_retries: u32,
}

impl ImportOptions {
    pub fn new(package_path: impl Into<PathBuf>, workspace: impl Into<String>) -> Self {
        Self {
            package_path: package_path.into(),
            workspace: workspace.into(),
            image_registry: None,
            mirror_registry: None,
            registry_user: None,
            registry_password: None,
            skip_image_load: false,
            skip_image_push: false,
            force: false,
            extract_dir: None,
            push_retries: DEFAULT_PUSH_RETRIES,
        }
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        let invalid = |msg: &str| Err(ImportError::Options(msg.to_string()));
        if !self.package_path.is_file() {
            return Err(ImportError::Options(format!(
                "package {} does not exist",
                self.package_path.display()
            )));
        }
        if self.skip_image_load && !self.skip_image_push {
            return invalid("skipping image load requires skipping image push");
        }
        if self.skip_image_push {
            return Ok(());
        }
        let given = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        match (given(&self.image_registry), given(&self.mirror_registry)) {
            (false, false) => invalid("an image registry or a mirror registry is required to push images"),
            (true, true) => invalid("image registry and mirror registry are mutually exclusive"),
            (false, true) if !given(&self.registry_user) || !given(&self.registry_password) => {
                invalid("mirror registry requires both username and password")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub manifest: PackageManifest,
    /// Pushed references.
    pub images_imported: Vec<String>,
    /// `<name>:<version>` of every registered engine version.
    pub engines_imported: Vec<String>,
}

/// Where and how images get pushed.
struct PushTarget {
    prefix: String,
    creds: Credentials,
    client: RegistryClient,
}

/// Recursive JSON merge: object keys from `new` win, keys only in `old`
/// survive, anything else is replaced by `new`.
pub fn merge_json(old: &mut Value, new: Value) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            for (k, v) in new {
                match old.get_mut(&k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        old.insert(k, v);
                    }
                }
            }
        }
        (old, new) => *old = new,
    }
}

fn merge_version(old: &EngineVersion, new: &EngineVersion) -> anyhow::Result<EngineVersion> {
    let mut merged = serde_json::to_value(old)?;
    merge_json(&mut merged, serde_json::to_value(new)?);
    Ok(serde_json::from_value(merged)?)
}

pub struct Importer<S> {
    store: ResourceStore<S>,
    executor: Arc<dyn Executor>,
    docker_binary: String,
}

impl<S: MetaStore> Importer<S> {
    pub fn new(store: ResourceStore<S>, executor: Arc<dyn Executor>) -> Self {
        Self {
            store,
            executor,
            docker_binary: "docker".to_string(),
        }
    }

    pub fn docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker_binary = binary.into();
        self
    }

    pub async fn import(&self, opts: &ImportOptions) -> anyhow::Result<ImportResult> {
        opts.validate()?;

        // Resolve the push target before doing any heavy lifting.
        let target = if opts.skip_image_push {
            None
        } else {
            Some(self.push_target(opts).await?)
        };

        let (package_dir, _tmp) = match &opts.extract_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let tmp = tempfile::Builder::new().prefix("neutree-import-").tempdir()?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };

        let archive = opts.package_path.clone();
        let dest = package_dir.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await?
            .with_context(|| format!("extract package {}", opts.package_path.display()))?;

        let manifest = PackageManifest::load(&package_dir)?;
        manifest.validate(&package_dir)?;
        tracing::info!(
            images = manifest.images.len(),
            engines = manifest.engines.len(),
            "package manifest validated"
        );

        let mut result = ImportResult {
            manifest,
            ..Default::default()
        };

        if !opts.skip_image_load {
            for file in result.manifest.image_files() {
                self.load_image(&package_dir.join(file)).await?;
            }
        }

        if let Some(target) = &target {
            for file in result.manifest.image_files() {
                let pushed = target
                    .client
                    .push_tar(
                        &package_dir.join(file),
                        &target.prefix,
                        &target.creds,
                        opts.push_retries,
                    )
                    .await
                    .with_context(|| format!("push images of {file}"))?;
                result.images_imported.extend(pushed);
            }
        }

        for engine in &result.manifest.engines {
            let imported = self
                .register_engine(&opts.workspace, engine, opts.force)
                .await
                .with_context(|| format!("register engine {}", engine.name))?;
            result.engines_imported.extend(imported);
        }

        tracing::info!(
            images = result.images_imported.len(),
            engines = result.engines_imported.len(),
            "package imported"
        );
        Ok(result)
    }

    async fn push_target(&self, opts: &ImportOptions) -> anyhow::Result<PushTarget> {
        if let Some(name) = opts.image_registry.as_deref().filter(|s| !s.is_empty()) {
            let registry = self
                .store
                .get_image_registry(&opts.workspace, name)
                .await?
                .ok_or_else(|| {
                    ImportError::Dependency(format!(
                        "image registry {}/{name} not found",
                        opts.workspace
                    ))
                })?;
            registry.ensure_usable()?;
            return Ok(PushTarget {
                prefix: registry.image_prefix(),
                creds: Credentials::from(&registry.spec.authconfig),
                client: RegistryClient::for_registry(&registry)?,
            });
        }
        let mirror = opts.mirror_registry.clone().unwrap_or_default();
        Ok(PushTarget {
            prefix: mirror.trim_end_matches('/').to_string(),
            creds: match (&opts.registry_user, &opts.registry_password) {
                (Some(user), Some(password)) => Credentials::basic(user, password),
                _ => Credentials::Anonymous,
            },
            client: RegistryClient::new()?,
        })
    }

    async fn load_image(&self, path: &Path) -> anyhow::Result<()> {
        let args = vec!["load".to_string(), "-i".to_string(), path.display().to_string()];
        let out = self
            .executor
            .execute(&self.docker_binary, &args)
            .await
            .with_context(|| format!("load image {}", path.display()))?;
        tracing::info!(file = %path.display(), output = %String::from_utf8_lossy(&out).trim(), "image loaded");
        Ok(())
    }

    /// Creates the engine or folds the new versions into the stored one.
    async fn register_engine(
        &self,
        workspace: &str,
        meta: &EngineMetadata,
        force: bool,
    ) -> anyhow::Result<Vec<String>> {
        let imported: Vec<String> = meta
            .engine_versions
            .iter()
            .map(|v| format!("{}:{}", meta.name, v.version))
            .collect();

        let existing = self.store.list_engines(workspace, Some(&meta.name)).await?;
        let Some(mut stored) = existing.into_iter().next() else {
            let engine = Engine {
                metadata: Metadata::new(workspace, &meta.name),
                spec: EngineSpec {
                    versions: meta.engine_versions.clone(),
                    supported_tasks: meta.supported_tasks.clone(),
                },
            };
            self.store.create_engine(&engine).await?;
            tracing::info!(engine = %meta.name, "engine created");
            return Ok(imported);
        };

        let spec = &mut stored.object.spec;
        for version in &meta.engine_versions {
            match spec.versions.iter_mut().find(|v| v.version == version.version) {
                Some(current) if force => {
                    *current = merge_version(current, version)?;
                    tracing::info!(engine = %meta.name, version = %version.version, "engine version replaced");
                }
                Some(_) => {
                    tracing::warn!(engine = %meta.name, version = %version.version, "engine version exists, skipping");
                }
                None => spec.versions.push(version.clone()),
            }
        }
        for task in &meta.supported_tasks {
            if !spec.supported_tasks.contains(task) {
                spec.supported_tasks.push(task.clone());
            }
        }
        self.store.update_engine(&stored).await?;
        Ok(imported)
    }
}
