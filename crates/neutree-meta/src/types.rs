use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {0} already exists")]
    AlreadyExists(String),

    #[error("key {key} was modified concurrently (expected revision {expected}, found {actual})")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("metadata store: {0}")]
    Backend(#[from] etcd_client::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored value with its last modification revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    /// `None` for deletions.
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// The slice of the durable metadata store the core talks to. Records are
/// opaque bytes; typed access lives in [`crate::ResourceStore`].
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Insert a key that must not exist yet.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64>;

    /// Replace a key only if it is still at `expected_revision`.
    async fn update(&self, key: &str, value: Vec<u8>, expected_revision: u64) -> Result<u64>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Events for keys under `prefix` newer than `after_revision`.
    async fn watch(&self, prefix: &str, after_revision: Option<u64>) -> Result<WatchStream>;
}
