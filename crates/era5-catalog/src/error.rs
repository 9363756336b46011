//! Error types for catalog loading and request construction.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using CatalogError.
pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Cannot read catalog file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse catalog file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("No stream descriptor for {stream} at timestep {tstep}")]
    DescriptorNotFound { stream: String, tstep: String },

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Unknown timestep: {0}")]
    UnknownTimestep(String),

    #[error("Unknown output format: {0}")]
    UnknownFormat(String),
}
