//! Error types for mapview_core.

use thiserror::Error;

/// Error types for map, archive and tile operations.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode tile image: {0}")]
    Decode(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid archive: {0}")]
    Archive(String),

    #[error("Invalid map manifest: {0}")]
    Manifest(String),
}

/// Result type alias for map operations.
pub type MapResult<T> = Result<T, MapError>;
