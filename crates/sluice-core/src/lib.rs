//! Core types and shared utilities for the sluice ingestion pipeline.
//!
//! This crate provides:
//! - The [`Envelope`] that travels from a source webhook through a queue to a sink
//! - Declarative system configuration ([`Config`], [`SystemInfo`]) loaded from YAML
//! - Prometheus metrics helpers
//! - Shared error types

pub mod config;
mod envelope;
mod error;
pub mod metrics;

/// Version reported by the health check and `/debug/vars`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{Config, ReceiveRoute, Role, Secret, SystemInfo, SystemType, TableTarget};
pub use envelope::{Envelope, Object, Operation};
pub use error::{Error, Result};
