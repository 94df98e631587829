//! External system adapters.
//!
//! A system is either a **source** that pushes events to us over a webhook
//! or a **sink** that receives drained batches. The two contracts are
//! separate traits; [`configure`] builds the right one from a
//! [`SystemInfo`] and returns it tagged in a [`SystemHandle`].
//!
//! Every adapter moves through
//! `Configured → Connecting → Ready → Draining → Closed`. Connecting runs a
//! single ping under a timeout; an adapter whose ping fails never
//! becomes Ready and is left out of [`Systems`].

pub mod clickhouse;
pub mod mssql;
pub mod mysql;
pub mod oracle;
pub mod postgres;
pub mod snowflake;
pub mod sql;
pub mod stripe;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use parking_lot::Mutex;
use sluice_core::{Config, Envelope, Object, Role, SystemInfo, SystemType};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ingest::Ingestor;

pub use self::clickhouse::ClickHouseSink;
pub use self::mssql::MssqlSink;
pub use self::mysql::MysqlSink;
pub use self::oracle::OracleSink;
pub use self::postgres::PostgresSink;
pub use self::snowflake::SnowflakeSink;
pub use self::stripe::StripeSource;

/// Deadline for an adapter's connection check.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A webhook delivery as the router hands it over.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A system that pushes events to us.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn info(&self) -> &SystemInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Ping the upstream API and start any forwarding helper.
    async fn connect(&self) -> Result<()>;

    /// Decode, map, validate and enqueue one delivery. Returns the number of
    /// objects enqueued.
    async fn handle_webhook(&self, ingestor: &Ingestor, request: WebhookRequest) -> Result<usize>;

    /// Reshape a raw source object once per receive route; each entry is
    /// the schema key to validate against and the canonical object.
    fn map_properties(&self, source_object: &str, raw: Object) -> Vec<(String, Object)>;

    async fn shutdown(&self);
}

/// A system that receives drained batches.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    fn info(&self) -> &SystemInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Build the connection pool and run a ping query on it.
    async fn open_connection(&self) -> Result<()>;

    /// Write every envelope of one object type in a single unit of work.
    async fn write_batch(&self, object: &str, items: &[Envelope]) -> Result<()>;

    async fn close(&self);

    fn push_frequency(&self) -> Duration {
        self.info().push_frequency
    }

    fn batch_size(&self) -> usize {
        self.info().batch_size
    }
}

/// A constructed adapter, tagged by capability.
#[derive(Clone)]
pub enum SystemHandle {
    Source(Arc<dyn SourceAdapter>),
    Sink(Arc<dyn SinkAdapter>),
}

impl SystemHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Source(s) => s.name(),
            Self::Sink(s) => s.name(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Source(_) => Role::Source,
            Self::Sink(_) => Role::Sink,
        }
    }

    async fn connect(&self) -> Result<()> {
        match self {
            Self::Source(s) => s.connect().await,
            Self::Sink(s) => s.open_connection().await,
        }
    }

    async fn close(&self) {
        match self {
            Self::Source(s) => s.shutdown().await,
            Self::Sink(s) => s.close().await,
        }
    }
}

impl fmt::Debug for SystemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(s) => f.debug_tuple("Source").field(&s.name()).finish(),
            Self::Sink(s) => f.debug_tuple("Sink").field(&s.name()).finish(),
        }
    }
}

/// Adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Configured,
    Connecting,
    Ready,
    Draining,
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configured => "configured",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Closed => "closed",
        })
    }
}

/// Process details some adapters need at construction time.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext {
    /// Port the HTTP server listens on, for forwarding helpers.
    pub listen_port: u16,
}

/// Construct the adapter for one system record. Nothing is contacted yet.
pub fn configure(info: &SystemInfo, ctx: &BuildContext) -> Result<SystemHandle> {
    let info = info.clone();
    let handle = match info.system_type {
        SystemType::Stripe => SystemHandle::Source(Arc::new(StripeSource::new(info, ctx.listen_port)?)),
        SystemType::Postgresql => SystemHandle::Sink(Arc::new(PostgresSink::new(info))),
        SystemType::Mysql => SystemHandle::Sink(Arc::new(MysqlSink::new(info))),
        SystemType::Mssql => SystemHandle::Sink(Arc::new(MssqlSink::new(info))),
        SystemType::Oracle => SystemHandle::Sink(Arc::new(OracleSink::new(info))),
        SystemType::Snowflake => SystemHandle::Sink(Arc::new(SnowflakeSink::new(info)?)),
        SystemType::Clickhouse => SystemHandle::Sink(Arc::new(ClickHouseSink::new(info)?)),
    };
    Ok(handle)
}

/// An adapter together with its lifecycle state.
#[derive(Debug)]
pub struct Adapter {
    handle: SystemHandle,
    state: Mutex<Lifecycle>,
}

impl Adapter {
    pub fn new(handle: SystemHandle) -> Self {
        Self {
            handle,
            state: Mutex::new(Lifecycle::Configured),
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> &SystemHandle {
        &self.handle
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.lock()
    }

    /// Run the connection check. Success moves the adapter to Ready; failure or
    /// timeout closes it and reports [`Error::AdapterUnavailable`].
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        *self.state.lock() = Lifecycle::Connecting;
        debug!(system = %self.name(), "connecting");

        let outcome = match tokio::time::timeout(timeout, self.handle.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connection check timed out after {timeout:?}")),
        };

        match outcome {
            Ok(()) => {
                *self.state.lock() = Lifecycle::Ready;
                info!(system = %self.name(), "system ready");
                Ok(())
            }
            Err(reason) => {
                self.close().await;
                Err(Error::AdapterUnavailable {
                    system: self.name().to_string(),
                    reason,
                })
            }
        }
    }

    /// Note that shutdown has begun; workers are finishing their batches.
    pub fn begin_draining(&self) {
        let mut state = self.state.lock();
        if *state == Lifecycle::Ready {
            *state = Lifecycle::Draining;
        }
    }

    /// Release connections. Closing twice is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == Lifecycle::Closed {
                return;
            }
            *state = Lifecycle::Closed;
        }
        self.handle.close().await;
        debug!(system = %self.name(), "system closed");
    }
}

/// The read-only map of Ready adapters, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Systems {
    adapters: BTreeMap<String, Arc<Adapter>>,
}

impl Systems {
    /// Configure every system in `config` and connect them concurrently.
    ///
    /// A system that cannot be configured is a configuration error. A system
    /// whose ping fails is logged and left out; startup only fails when
    /// systems are configured and none of them connects.
    pub async fn open(config: &Config, ctx: &BuildContext, connect_timeout: Duration) -> Result<Self> {
        let mut adapters = Vec::with_capacity(config.systems.len());
        for info in &config.systems {
            adapters.push(Arc::new(Adapter::new(configure(info, ctx)?)));
        }

        let mut checks = JoinSet::new();
        for adapter in adapters {
            checks.spawn(async move {
                let result = adapter.connect(connect_timeout).await;
                (adapter, result)
            });
        }

        let configured = config.systems.len();
        let mut systems = Self::default();
        while let Some(joined) = checks.join_next().await {
            let (adapter, result) = joined.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            match result {
                Ok(()) => systems.insert(adapter),
                Err(e) => warn!(error = %e, "system omitted"),
            }
        }

        if configured > 0 && systems.is_empty() {
            return Err(Error::Config(format!(
                "none of the {configured} configured systems could be connected"
            )));
        }

        info!(
            ready = systems.len(),
            configured,
            "systems opened"
        );
        Ok(systems)
    }

    pub fn insert(&mut self, adapter: Arc<Adapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Ready source adapter registered under `name`.
    pub fn source(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        match self.adapters.get(name)?.handle() {
            SystemHandle::Source(source) => Some(Arc::clone(source)),
            SystemHandle::Sink(_) => None,
        }
    }

    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.adapters
            .values()
            .filter(|a| a.handle().role() == Role::Source)
            .map(|a| a.name())
    }

    pub fn sinks(&self) -> impl Iterator<Item = &Arc<dyn SinkAdapter>> {
        self.adapters.values().filter_map(|a| match a.handle() {
            SystemHandle::Sink(sink) => Some(sink),
            SystemHandle::Source(_) => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Adapter>> {
        self.adapters.values()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Adapter>> {
        self.adapters.get(name)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn begin_draining(&self) {
        for adapter in self.adapters.values() {
            adapter.begin_draining();
        }
    }

    pub async fn close_all(&self) {
        for adapter in self.adapters.values() {
            adapter.close().await;
        }
    }
}
