//! Error types for the ingestion pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::queue::QueueError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting or draining.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Core config or envelope error.
    #[error(transparent)]
    Core(#[from] sluice_core::Error),

    /// An adapter's connection check failed.
    #[error("System '{system}' unavailable: {reason}")]
    AdapterUnavailable { system: String, reason: String },

    /// A schema file could not be read or compiled.
    #[error("Schema {path}: {reason}")]
    SchemaCompile { path: PathBuf, reason: String },

    /// The queue root directory could not be created.
    #[error("Queue directory {path}: {source}")]
    QueueSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Queue open or I/O failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// No schema (and so no queue) exists for an object type.
    #[error("Unknown object type '{0}'")]
    UnknownObject(String),

    /// An object failed schema validation.
    #[error("validation failed for '{object}': {}", errors.join("; "))]
    Validation { object: String, errors: Vec<String> },

    /// An append to a queue failed.
    #[error("Enqueue to '{object}' failed: {source}")]
    Enqueue {
        object: String,
        #[source]
        source: QueueError,
    },

    /// A sink rejected a batch.
    #[error("Write to sink '{system}' failed: {reason}")]
    SinkWrite { system: String, reason: String },

    /// A webhook body could not be interpreted.
    #[error("Webhook error: {0}")]
    Webhook(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// PostgreSQL / MySQL error.
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// ClickHouse error.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// Oracle error.
    #[error("Oracle error: {0}")]
    Oracle(#[from] oracle::Error),

    /// SQL Server error.
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),
}
