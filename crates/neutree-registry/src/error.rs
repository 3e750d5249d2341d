use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("registry returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("registry authentication failed: {0}")]
    Auth(String),

    #[error("image tarball: {0}")]
    Tarball(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn invalid(reference: &str, reason: impl Into<String>) -> Self {
        RegistryError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}
