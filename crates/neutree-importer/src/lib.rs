//! Offline package import: images into a registry, engines into the store.

pub mod error;
pub mod extract;
pub mod importer;
pub mod manifest;

pub use error::ImportError;
pub use extract::extract_archive;
pub use importer::{merge_json, ImportOptions, ImportResult, Importer, DEFAULT_PUSH_RETRIES};
pub use manifest::{EngineMetadata, ImageSpec, PackageManifest, PackageMetadata};
