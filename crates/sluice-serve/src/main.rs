//! Sluice webhook ingestion service.
//!
//! Receives webhooks from source systems, validates them against JSON
//! Schemas, parks them in durable per-object queues and drains the queues
//! into SQL sinks.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (config.yaml, ./schemas, queues under /tmp)
//! sluice
//!
//! # Custom paths and port
//! sluice --port 8080 --config /etc/sluice/config.yaml \
//!     --schemas-dir /etc/sluice/schemas --queue-dir /var/lib/sluice
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT and SIGTERM trigger an orderly shutdown:
//! 1. Stop accepting connections (5 second grace for in-flight requests)
//! 2. Let drain workers finish their current batch
//! 3. Fsync and close every queue
//! 4. Close adapter connections
//!
//! Exit status is 0 on a clean shutdown, 1 on a startup or shutdown
//! failure, 2 when in-flight requests outlived the grace period.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sluice_core::metrics::{init_metrics, start_metrics_server};
use sluice_ingest::queue::DEFAULT_SEGMENT_SIZE;
use sluice_ingest::{Durability, QueueOptions};
use sluice_serve::supervisor::{self, SHUTDOWN_GRACE};
use sluice_serve::{Exit, Settings};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LOG_FILTER: &str = "info,sluice_ingest=debug,sluice_serve=debug";

/// Sluice webhook ingestion service.
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Webhook ingestion with durable queues and SQL sinks", long_about = None)]
#[command(version)]
struct Args {
    /// HTTP port for webhooks and health checks
    #[arg(long, env = "SLUICE_PORT", default_value_t = 4000)]
    port: u16,

    /// Path to the systems configuration file
    #[arg(long, env = "SLUICE_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Directory of JSON Schema files, one per object type
    #[arg(long, env = "SLUICE_SCHEMAS_DIR", default_value = "./schemas")]
    schemas_dir: PathBuf,

    /// Root directory for per-object queues
    #[arg(long, env = "SLUICE_QUEUE_DIR", default_value = "/tmp")]
    queue_dir: PathBuf,

    /// Records per queue segment before it is sealed
    #[arg(long, env = "SLUICE_SEGMENT_SIZE", default_value_t = DEFAULT_SEGMENT_SIZE)]
    segment_size: usize,

    /// Fsync every queue append and acknowledge webhooks only after it
    #[arg(long, env = "SLUICE_FSYNC_EVERY_WRITE")]
    fsync_every_write: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "SLUICE_METRICS_PORT", default_value_t = 0)]
    metrics_port: u16,

    /// Emit logs as JSON
    #[arg(long, env = "SLUICE_LOG_JSON")]
    log_json: bool,

    /// Path to .env file (optional)
    #[arg(long, env = "SLUICE_DOTENV", default_value = ".env")]
    dotenv: PathBuf,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load .env file if it exists
    let dotenv_loaded = args.dotenv.exists() && dotenvy::from_path(&args.dotenv).is_ok();

    init_tracing(args.log_json);
    if dotenv_loaded {
        tracing::info!(path = %args.dotenv.display(), "loaded environment");
    }
    tracing::info!(version = sluice_core::VERSION, "sluice starting");

    if args.metrics_port > 0 {
        match init_metrics() {
            Some(handle) => {
                if let Err(e) = start_metrics_server(args.metrics_port, handle).await {
                    tracing::error!(error = %e, port = args.metrics_port, "cannot start metrics server");
                    return Exit::Failed.into();
                }
            }
            None => tracing::warn!("metrics recorder already installed"),
        }
    }

    let durability = if args.fsync_every_write {
        Durability::EveryWrite
    } else {
        Durability::OnRotation
    };

    let settings = Settings {
        port: args.port,
        config_path: args.config,
        schemas_dir: args.schemas_dir,
        queue_dir: args.queue_dir,
        queue_options: QueueOptions {
            segment_size: args.segment_size,
            durability,
        },
        ack_after_write: args.fsync_every_write,
        shutdown_grace: SHUTDOWN_GRACE,
    };

    supervisor::run(settings).await.into()
}
