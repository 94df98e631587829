//! Sluice ingestion pipeline components.
//!
//! This crate takes webhook deliveries from source systems, reshapes and
//! validates them, parks them in durable per-object queues, and drains the
//! queues into sink systems.
//!
//! # Modules
//!
//! - [`queue`] - Segmented on-disk FIFO queues, one per object type
//! - [`schema`] - JSON Schema registry; one schema per object type
//! - [`mapper`] - Dotted-path property renames for receive routes
//! - [`ingest`] - Validate and enqueue canonical objects
//! - [`system`] - Source and sink adapters, lifecycle and registry
//! - [`drain`] - Drain workers with backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Source adapter  │  decode webhook, map properties
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    Ingestor     │  validate against the object's schema
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │      Queue      │  seg-NNNNNNNN.q files + head.cursor
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Drain worker   │  peek batch → sink.write_batch → dequeue
//! └─────────────────┘
//! ```
//!
//! The queue is the source of truth between ingestion and delivery: an
//! envelope leaves it only after a sink has accepted it.

pub mod drain;
pub mod error;
pub mod ingest;
pub mod mapper;
pub mod queue;
pub mod schema;
pub mod system;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use drain::{Assignment, Backoff, DrainWorker, Drainers, consumers_by_object, plan_assignments};
pub use ingest::Ingestor;
pub use queue::{Durability, Queue, QueueError, QueueOptions, QueueSet};
pub use schema::{Schema, SchemaRegistry};

pub use system::{
    Adapter, BuildContext, Lifecycle, SinkAdapter, SourceAdapter, SystemHandle, Systems,
    WebhookRequest, configure,
};
