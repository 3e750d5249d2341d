//! Registry v2 client: existence checks, tag listing and pushing
//! `docker save` archives.

pub mod auth;
pub mod client;
pub mod error;
pub mod push;
pub mod reference;
pub mod tarball;

pub use auth::{default_keychain, Credentials};
pub use client::RegistryClient;
pub use error::{RegistryError, Result};
pub use reference::{rewrite_image, short_repo, Reference};
