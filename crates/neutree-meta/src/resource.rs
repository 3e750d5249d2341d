use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use neutree_common::{Cluster, Endpoint, Engine, ImageRegistry, ModelRegistry};

use crate::types::{MetaStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cluster,
    Endpoint,
    Engine,
    ImageRegistry,
    ModelRegistry,
}

impl ResourceKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "/clusters/",
            ResourceKind::Endpoint => "/endpoints/",
            ResourceKind::Engine => "/engines/",
            ResourceKind::ImageRegistry => "/image_registries/",
            ResourceKind::ModelRegistry => "/model_registries/",
        }
    }

    /// `/<kind>/<workspace>/<name>`
    pub fn key(&self, workspace: &str, name: &str) -> String {
        format!("{}{}/{}", self.prefix(), workspace, name)
    }
}

/// A decoded record together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub object: T,
    pub revision: u64,
}

/// Typed access to workspace-scoped records.
#[derive(Debug, Clone)]
pub struct ResourceStore<S> {
    store: S,
}

impl<S: MetaStore> ResourceStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        workspace: &str,
        name: &str,
    ) -> anyhow::Result<Option<Stored<T>>> {
        let key = kind.key(workspace, name);
        let Some(v) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let object = serde_json::from_slice(&v.value).with_context(|| format!("decode {key}"))?;
        Ok(Some(Stored {
            object,
            revision: v.revision,
        }))
    }

    /// All records of `kind` in `workspace`; undecodable entries are skipped.
    pub async fn list<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        workspace: &str,
    ) -> anyhow::Result<Vec<Stored<T>>> {
        let prefix = format!("{}{}/", kind.prefix(), workspace);
        let mut out = Vec::new();
        for (key, v) in self.store.list(&prefix).await? {
            match serde_json::from_slice(&v.value) {
                Ok(object) => out.push(Stored {
                    object,
                    revision: v.revision,
                }),
                Err(e) => tracing::warn!(%key, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    pub async fn create<T: Serialize>(
        &self,
        kind: ResourceKind,
        workspace: &str,
        name: &str,
        object: &T,
    ) -> anyhow::Result<u64> {
        let key = kind.key(workspace, name);
        let bytes = serde_json::to_vec(object)?;
        Ok(self
            .store
            .create(&key, bytes)
            .await
            .with_context(|| format!("create {key}"))?)
    }

    pub async fn update<T: Serialize>(
        &self,
        kind: ResourceKind,
        workspace: &str,
        name: &str,
        object: &T,
        revision: u64,
    ) -> anyhow::Result<u64> {
        let key = kind.key(workspace, name);
        let bytes = serde_json::to_vec(object)?;
        Ok(self
            .store
            .update(&key, bytes, revision)
            .await
            .with_context(|| format!("update {key}"))?)
    }

    /// Create, or overwrite whatever revision is current.
    pub async fn put<T: Serialize>(
        &self,
        kind: ResourceKind,
        workspace: &str,
        name: &str,
        object: &T,
    ) -> anyhow::Result<u64> {
        let key = kind.key(workspace, name);
        let bytes = serde_json::to_vec(object)?;
        match self.store.get(&key).await? {
            Some(v) => Ok(self.store.update(&key, bytes, v.revision).await?),
            None => match self.store.create(&key, bytes.clone()).await {
                Err(StoreError::AlreadyExists(_)) => {
                    let rev = self.store.get(&key).await?.map(|v| v.revision).unwrap_or(0);
                    Ok(self.store.update(&key, bytes, rev).await?)
                }
                other => Ok(other?),
            },
        }
    }

    pub async fn delete(&self, kind: ResourceKind, workspace: &str, name: &str) -> anyhow::Result<bool> {
        Ok(self.store.delete(&kind.key(workspace, name)).await?)
    }

    // -- typed shortcuts used by the importer and the CLI --

    pub async fn list_engines(
        &self,
        workspace: &str,
        name: Option<&str>,
    ) -> anyhow::Result<Vec<Stored<Engine>>> {
        let mut engines: Vec<Stored<Engine>> = self.list(ResourceKind::Engine, workspace).await?;
        if let Some(name) = name {
            engines.retain(|e| e.object.metadata.name == name);
        }
        Ok(engines)
    }

    pub async fn create_engine(&self, engine: &Engine) -> anyhow::Result<u64> {
        let m = &engine.metadata;
        self.create(ResourceKind::Engine, &m.workspace, &m.name, engine)
            .await
    }

    pub async fn update_engine(&self, engine: &Stored<Engine>) -> anyhow::Result<u64> {
        let m = &engine.object.metadata;
        self.update(
            ResourceKind::Engine,
            &m.workspace,
            &m.name,
            &engine.object,
            engine.revision,
        )
        .await
    }

    pub async fn get_image_registry(
        &self,
        workspace: &str,
        name: &str,
    ) -> anyhow::Result<Option<ImageRegistry>> {
        Ok(self
            .get(ResourceKind::ImageRegistry, workspace, name)
            .await?
            .map(|s| s.object))
    }

    pub async fn get_cluster(&self, workspace: &str, name: &str) -> anyhow::Result<Option<Stored<Cluster>>> {
        self.get(ResourceKind::Cluster, workspace, name).await
    }

    pub async fn get_endpoint(&self, workspace: &str, name: &str) -> anyhow::Result<Option<Endpoint>> {
        Ok(self
            .get(ResourceKind::Endpoint, workspace, name)
            .await?
            .map(|s| s.object))
    }

    pub async fn get_model_registry(
        &self,
        workspace: &str,
        name: &str,
    ) -> anyhow::Result<Option<ModelRegistry>> {
        Ok(self
            .get(ResourceKind::ModelRegistry, workspace, name)
            .await?
            .map(|s| s.object))
    }
}
