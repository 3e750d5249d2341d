use std::sync::Arc;

use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{MetaStore, Result, StoreError, Versioned, WatchEvent, WatchStream};

#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> anyhow::Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }

    async fn current_revision(cli: &mut Client, key: &str) -> Result<u64> {
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| kv.mod_revision() as u64)
            .unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            revision: kv.mod_revision() as u64,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let mut cli = self.client.lock().await;
        let resp = cli
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    Versioned {
                        value: kv.value().to_vec(),
                        revision: kv.mod_revision() as u64,
                    },
                )
            })
            .collect())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut cli = self.client.lock().await;
        // create_revision == 0 only holds for absent keys
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = cli.txn(txn).await?;
        if !resp.succeeded() {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected_revision: u64) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let txn = Txn::new()
            .when([Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected_revision as i64,
            )])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = cli.txn(txn).await?;
        if resp.succeeded() {
            return Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64);
        }
        let actual = Self::current_revision(&mut cli, key).await?;
        Err(StoreError::Conflict {
            key: key.to_string(),
            expected: expected_revision,
            actual,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, Some(DeleteOptions::new())).await?;
        Ok(resp.deleted() > 0)
    }

    async fn watch(&self, prefix: &str, after_revision: Option<u64>) -> Result<WatchStream> {
        let mut cli = self.client.lock().await;

        let mut opts = WatchOptions::new().with_prefix();
        if let Some(min_rev) = after_revision {
            // etcd start_revision is inclusive
            opts = opts.with_start_revision(min_rev.saturating_add(1) as i64);
        }

        let (watcher, mut stream) = cli.watch(prefix, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(256);
        tokio::spawn(async move {
            // keep the watcher alive for as long as the stream is consumed
            let _watcher = watcher;
            while let Some(item) = stream.message().await.transpose() {
                let resp = match item {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "etcd watch stream failed");
                        return;
                    }
                };
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let value = match ev.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    let event = WatchEvent {
                        key: String::from_utf8_lossy(kv.key()).to_string(),
                        value,
                        revision: kv.mod_revision() as u64,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
