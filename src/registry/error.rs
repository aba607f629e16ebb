//! Package registry error types.

use thiserror::Error;

/// Package registry error type. Variants carry strings so the error can
/// be cloned across the coalescing map.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Failed to fetch dependency manifest: {0}")]
    Manifest(String),

    #[error("Failed to fetch package {name}@{version}: {message}")]
    PackageFetch {
        name: String,
        version: String,
        message: String,
    },

    #[error("Invalid packager response for {name}@{version}: {message}")]
    InvalidPayload {
        name: String,
        version: String,
        message: String,
    },

    #[error("Invalid registry URL: {0}")]
    InvalidUrl(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
