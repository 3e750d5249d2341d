pub mod etcd;
pub mod memory;
pub mod resource;
pub mod types;

pub use etcd::EtcdMetaStore;
pub use memory::MemoryMetaStore;
pub use resource::{ResourceKind, ResourceStore, Stored};
pub use types::{MetaStore, StoreError, Versioned, WatchEvent, WatchStream};
