use thiserror::Error;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// Image URL that could not be parsed at all
    #[error("bad image url: {0}")]
    BadUrl(String),

    /// `oci:<path>:<tag>` reference with the wrong number of fields
    #[error("bad OCI tag: {0}")]
    BadOciTag(String),

    /// Image URL with an unsupported scheme
    #[error("invalid image url: {0}")]
    InvalidImageUrl(String),

    /// Malformed or inconsistent recipe input
    #[error("recipe error: {0}")]
    RecipeError(String),

    /// Descriptor expected in a manifest's layer chain but absent
    #[error("couldn't find descriptor {digest} in manifest {reference}")]
    DescriptorNotInManifest { digest: String, reference: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Non-zero exit from an external command; carries combined output
    #[error("{command} failed: {output}")]
    SubprocessError { command: String, output: String },

    /// Blob, reference, or manifest operation on an OCI layout failed
    #[error("OCI layout error: {0}")]
    OciError(String),

    /// Cached state inconsistent with on-disk artifacts
    #[error("cache error: {0}")]
    CacheError(String),

    /// Rootfs storage driver error
    #[error("storage error: {0}")]
    StorageError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
