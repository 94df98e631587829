//! Error types shared by the sluice crates.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading configuration or handling envelopes.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML or has the wrong shape
    /// (this includes unknown system types).
    #[error("malformed config {path}: {source}")]
    ConfigParse {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration parsed but is semantically invalid.
    #[error("invalid config: {0}")]
    Config(String),

    /// An envelope payload was not a JSON object.
    #[error("envelope payload for '{object}' is not a JSON object")]
    PayloadNotObject {
        /// Object type the payload was destined for.
        object: String,
    },

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
