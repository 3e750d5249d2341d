use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{MetaStore, Result, StoreError, Versioned, WatchEvent, WatchStream};

/// Process-local store used by tests and single-shot CLI runs.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, Versioned>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn write(&mut self, key: &str, value: Vec<u8>) -> WatchEvent {
        let revision = self.bump();
        self.kv.insert(
            key.to_string(),
            Versioned {
                value: value.clone(),
                revision,
            },
        );
        WatchEvent {
            key: key.to_string(),
            value: Some(value),
            revision,
        }
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, event: WatchEvent) -> u64 {
        let rev = event.revision;
        let _ = self.tx.send(event);
        rev
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.inner.read().await.kv.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let event = {
            let mut inner = self.inner.write().await;
            if inner.kv.contains_key(key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            inner.write(key, value)
        };
        Ok(self.emit(event))
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected_revision: u64) -> Result<u64> {
        let event = {
            let mut inner = self.inner.write().await;
            let actual = inner.kv.get(key).map(|v| v.revision).unwrap_or(0);
            if actual != expected_revision {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: expected_revision,
                    actual,
                });
            }
            inner.write(key, value)
        };
        Ok(self.emit(event))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let event = {
            let mut inner = self.inner.write().await;
            if inner.kv.remove(key).is_none() {
                return Ok(false);
            }
            WatchEvent {
                key: key.to_string(),
                value: None,
                revision: inner.bump(),
            }
        };
        self.emit(event);
        Ok(true)
    }

    async fn watch(&self, prefix: &str, after_revision: Option<u64>) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = after_revision.unwrap_or(0);
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |msg| match msg {
            Ok(ev) if ev.revision > min_rev && ev.key.starts_with(&prefix) => Some(ev),
            _ => None,
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_conflicting_update() {
        let store = MemoryMetaStore::new();
        let rev = store.create("/engines/default/vllm", b"a".to_vec()).await.unwrap();
        assert!(matches!(
            store.create("/engines/default/vllm", b"b".to_vec()).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let rev2 = store.update("/engines/default/vllm", b"b".to_vec(), rev).await.unwrap();
        assert!(rev2 > rev);
        assert!(matches!(
            store.update("/engines/default/vllm", b"c".to_vec(), rev).await,
            Err(StoreError::Conflict { actual, .. }) if actual == rev2
        ));
    }

    #[tokio::test]
    async fn test_list_prefix_and_delete() {
        let store = MemoryMetaStore::new();
        store.create("/engines/a/x", b"1".to_vec()).await.unwrap();
        store.create("/engines/a/y", b"2".to_vec()).await.unwrap();
        store.create("/engines/b/x", b"3".to_vec()).await.unwrap();

        let keys: Vec<String> = store
            .list("/engines/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/engines/a/x", "/engines/a/y"]);

        assert!(store.delete("/engines/a/x").await.unwrap());
        assert!(!store.delete("/engines/a/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_filters_prefix() {
        let store = MemoryMetaStore::new();
        let mut watch = store.watch("/clusters/", None).await.unwrap();
        store.create("/engines/a/x", b"1".to_vec()).await.unwrap();
        store.create("/clusters/a/c1", b"2".to_vec()).await.unwrap();

        let ev = watch.next().await.unwrap();
        assert_eq!(ev.key, "/clusters/a/c1");
        assert_eq!(ev.value.as_deref(), Some(&b"2"[..]));
    }
}
