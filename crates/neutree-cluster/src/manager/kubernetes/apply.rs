//! Create-or-patch reconciliation of rendered objects.

use anyhow::Context;
use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::Client;
use serde_json::{Map, Value};

use super::objects::SKIP_PATCH_ANNOTATION;

/// Address of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn of(obj: &Value) -> anyhow::Result<Self> {
        let field = |v: Option<&Value>, what: &str| {
            v.and_then(Value::as_str)
                .map(str::to_string)
                .with_context(|| format!("object without {what}"))
        };
        Ok(Self {
            api_version: field(obj.get("apiVersion"), "apiVersion")?,
            kind: field(obj.get("kind"), "kind")?,
            namespace: obj
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: field(obj.pointer("/metadata/name"), "metadata.name")?,
        })
    }

    fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        };
        GroupVersionKind::gvk(group, version, &self.kind)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// The object operations reconciliation needs.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Option<Value>>;

    async fn create(&self, obj: &Value) -> anyhow::Result<()>;

    /// JSON merge patch.
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> anyhow::Result<()>;

    /// Deleting an absent object succeeds.
    async fn delete(&self, key: &ObjectKey) -> anyhow::Result<()>;

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<Value>>;
}

/// `ObjectApi` over a live API server using dynamic objects.
#[derive(Clone)]
pub struct KubeObjectApi {
    client: Client,
}

impl KubeObjectApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&key.gvk());
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ObjectApi for KubeObjectApi {
    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Option<Value>> {
        let obj = self
            .api(key)
            .get_opt(&key.name)
            .await
            .with_context(|| format!("get {key}"))?;
        obj.map(serde_json::to_value).transpose().map_err(Into::into)
    }

    async fn create(&self, obj: &Value) -> anyhow::Result<()> {
        let key = ObjectKey::of(obj)?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone())?;
        self.api(&key)
            .create(&PostParams::default(), &dynamic)
            .await
            .with_context(|| format!("create {key}"))?;
        Ok(())
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> anyhow::Result<()> {
        self.api(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("patch {key}"))?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> anyhow::Result<()> {
        match self.api(key).delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete {key}")),
        }
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<Value>> {
        let key = ObjectKey {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: Some(namespace.to_string()),
            name: String::new(),
        };
        let list = self
            .api(&key)
            .list(&ListParams::default().labels(label_selector))
            .await
            .with_context(|| format!("list {kind} in {namespace}"))?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(Into::into))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Patched,
    /// The server copy already carries every desired field.
    Unchanged,
    Skipped,
}

fn has_skip_patch(obj: &Value) -> bool {
    obj.pointer("/metadata/annotations")
        .and_then(|a| a.get(SKIP_PATCH_ANNOTATION))
        .and_then(Value::as_str)
        .is_some_and(|v| v == "true")
}

fn entry_name(v: &Value) -> Option<&str> {
    v.get("name").and_then(Value::as_str)
}

/// Whether `current` already holds everything `desired` sets. Array entries
/// with a `name` are matched by name, others by position, so defaults the
/// server fills into containers, ports or env entries do not count.
fn covers(current: &Value, desired: &Value) -> bool {
    match (current, desired) {
        (Value::Object(cur), Value::Object(want)) => want
            .iter()
            .all(|(k, v)| cur.get(k).is_some_and(|c| covers(c, v))),
        (Value::Array(cur), Value::Array(want)) => {
            cur.len() == want.len()
                && want.iter().enumerate().all(|(i, w)| {
                    let matched = match entry_name(w) {
                        Some(name) => cur.iter().find(|c| entry_name(c) == Some(name)),
                        None => cur.get(i),
                    };
                    matched.is_some_and(|c| covers(c, w))
                })
        }
        _ => current == desired,
    }
}

/// Merge patch turning `current` into `desired` for the fields `desired`
/// sets. Fields only present on the server are left alone; arrays that
/// differ are sent whole.
pub fn merge_diff(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(cur), Value::Object(want)) => {
            let mut patch = Map::new();
            for (k, v) in want {
                match cur.get(k) {
                    Some(c) if covers(c, v) => {}
                    Some(c @ Value::Object(_)) if v.is_object() => {
                        let nested = merge_diff(c, v);
                        if nested.as_object().is_some_and(|m| !m.is_empty()) {
                            patch.insert(k.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

/// GET; CREATE when absent; otherwise PATCH the difference unless the
/// server copy carries the skip-patch annotation or nothing differs.
pub async fn create_or_patch(api: &dyn ObjectApi, desired: &Value) -> anyhow::Result<ApplyOutcome> {
    let key = ObjectKey::of(desired)?;
    let Some(current) = api.get(&key).await? else {
        api.create(desired).await?;
        tracing::info!(object = %key, "created");
        return Ok(ApplyOutcome::Created);
    };
    if has_skip_patch(&current) {
        tracing::debug!(object = %key, "skip-patch annotation set, leaving as is");
        return Ok(ApplyOutcome::Skipped);
    }
    let patch = merge_diff(&current, desired);
    if patch.as_object().is_some_and(Map::is_empty) {
        tracing::debug!(object = %key, "up to date");
        return Ok(ApplyOutcome::Unchanged);
    }
    api.patch(&key, &patch).await?;
    tracing::debug!(object = %key, patch = %patch, "patched");
    Ok(ApplyOutcome::Patched)
}


#[cfg(test)]
mod tests {
    use super::fake::MemoryObjectApi;
    use super::*;
    use serde_json::json;

    fn namespace(labels: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "neutree-cluster-abc", "labels": labels}
        })
    }

    #[tokio::test]
    async fn test_create_then_patch() {
        let api = MemoryObjectApi::default();
        let ns = namespace(json!({"neutree-cluster": "prod"}));

        assert_eq!(create_or_patch(&api, &ns).await.unwrap(), ApplyOutcome::Created);
        assert_eq!(create_or_patch(&api, &ns).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(api.mutations(), vec!["create Namespace/neutree-cluster-abc"]);

        let changed = namespace(json!({"neutree-cluster": "staging"}));
        assert_eq!(create_or_patch(&api, &changed).await.unwrap(), ApplyOutcome::Patched);
        assert_eq!(
            api.ops(),
            vec![
                "get Namespace/neutree-cluster-abc",
                "create Namespace/neutree-cluster-abc",
                "get Namespace/neutree-cluster-abc",
                "get Namespace/neutree-cluster-abc",
                "patch Namespace/neutree-cluster-abc",
            ]
        );
        let stored = api.object("Namespace/neutree-cluster-abc").unwrap();
        assert_eq!(stored["metadata"]["labels"]["neutree-cluster"], "staging");
    }

    fn pod(containers: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "head", "namespace": "ns"},
            "spec": {"containers": containers}
        })
    }

    #[tokio::test]
    async fn test_server_defaults_do_not_trigger_patch() {
        let api = MemoryObjectApi::default();
        let desired = pod(json!([
            {"name": "ray-head", "image": "img", "ports": [{"name": "gcs", "containerPort": 6379}]},
            {"name": "vmagent", "image": "vm"}
        ]));
        // As returned by the server: defaults filled in, entries reordered.
        api.insert(pod(json!([
            {"name": "vmagent", "image": "vm", "imagePullPolicy": "IfNotPresent"},
            {
                "name": "ray-head",
                "image": "img",
                "imagePullPolicy": "IfNotPresent",
                "terminationMessagePath": "/dev/termination-log",
                "ports": [{"name": "gcs", "containerPort": 6379, "protocol": "TCP"}]
            }
        ])));

        assert_eq!(create_or_patch(&api, &desired).await.unwrap(), ApplyOutcome::Unchanged);
        assert!(api.mutations().is_empty());

        let bumped = pod(json!([
            {"name": "ray-head", "image": "img2", "ports": [{"name": "gcs", "containerPort": 6379}]},
            {"name": "vmagent", "image": "vm"}
        ]));
        assert_eq!(create_or_patch(&api, &bumped).await.unwrap(), ApplyOutcome::Patched);
        assert_eq!(api.mutations(), vec!["patch Pod/ns/head"]);
    }

    #[tokio::test]
    async fn test_skip_patch_annotation() {
        let api = MemoryObjectApi::default();
        let mut ns = namespace(json!({}));
        ns["metadata"]["annotations"] = json!({ SKIP_PATCH_ANNOTATION: "true" });
        create_or_patch(&api, &ns).await.unwrap();

        ns["metadata"]["labels"] = json!({"changed": "yes"});
        assert_eq!(create_or_patch(&api, &ns).await.unwrap(), ApplyOutcome::Skipped);
        assert_eq!(api.mutations(), vec!["create Namespace/neutree-cluster-abc"]);
        let stored = api.object("Namespace/neutree-cluster-abc").unwrap();
        assert_eq!(stored["metadata"]["labels"], json!({}));
    }

    #[test]
    fn test_merge_diff_preserves_server_fields() {
        let current = json!({
            "metadata": {
                "name": "x",
                "uid": "123",
                "resourceVersion": "9",
                "labels": {"a": "1", "server": "kept"},
                "annotations": {"by-server": "yes"}
            },
            "data": {"k": "old"}
        });
        let desired = json!({
            "metadata": {"name": "x", "labels": {"a": "1"}},
            "data": {"k": "new"}
        });
        assert_eq!(merge_diff(&current, &desired), json!({"data": {"k": "new"}}));
        assert_eq!(merge_diff(&current, &current), json!({}));

        let desired = json!({"spec": {"ports": [1, 2]}});
        let current = json!({"spec": {"ports": [1]}});
        assert_eq!(merge_diff(&current, &desired), json!({"spec": {"ports": [1, 2]}}));

        let current = json!({"spec": {"containers": [
            {"name": "ray-head", "image": "img", "imagePullPolicy": "Always", "terminationMessagePath": "/dev/termination-log"}
        ]}});
        let desired = json!({"spec": {"containers": [{"name": "ray-head", "image": "img"}]}});
        assert_eq!(merge_diff(&current, &desired), json!({}));
        let desired = json!({"spec": {"containers": [{"name": "other", "image": "img"}]}});
        assert_eq!(merge_diff(&current, &desired), desired);
    }

    #[test]
    fn test_object_key() {
        let key = ObjectKey::of(&json!({
            "apiVersion": "ray.io/v1",
            "kind": "RayCluster",
            "metadata": {"name": "prod", "namespace": "ns"}
        }))
        .unwrap();
        assert_eq!(key.to_string(), "RayCluster/ns/prod");
        let gvk = key.gvk();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str()), ("ray.io", "v1"));
        assert!(ObjectKey::of(&json!({"kind": "X"})).is_err());
    }
}
