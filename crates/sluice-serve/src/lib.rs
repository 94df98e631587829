//! Sluice Serve - HTTP surface and process supervisor.
//!
//! This crate exposes the webhook endpoints source systems post to, the
//! health and debug routes, and the supervisor that wires queues, adapters
//! and drain workers together for the `sluice` binary.
//!
//! # Architecture
//!
//! - **AppState**: Shared application state (ingestor, ready systems)
//! - **Routes**: Webhook, health and debug handlers
//! - **Serve**: Listener loop with header-read and idle timeouts
//! - **Supervisor**: Startup order, signal handling, graceful shutdown

mod error;
mod routes;
pub mod serve;
mod state;
pub mod supervisor;

pub use self::error::ApiError;
pub use self::routes::router;
pub use self::state::AppState;
pub use self::supervisor::{Exit, Running, Settings};
