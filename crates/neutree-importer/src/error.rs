use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid import options: {0}")]
    Options(String),

    #[error("invalid package manifest: {0}")]
    Manifest(String),

    #[error("invalid package archive: {0}")]
    Archive(String),

    #[error("{0}")]
    Dependency(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ImportError>;
