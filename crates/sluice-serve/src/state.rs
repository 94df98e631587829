//! Application state shared by request handlers.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice_ingest::{Ingestor, Systems};
use tokio_util::task::TaskTracker;

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct Inner {
    ingestor: Ingestor,
    systems: Systems,
    started_at: Instant,
    ack_after_write: bool,
    handlers: TaskTracker,
}

impl AppState {
    pub fn new(ingestor: Ingestor, systems: Systems) -> Self {
        Self {
            inner: Arc::new(Inner {
                ingestor,
                systems,
                started_at: Instant::now(),
                ack_after_write: false,
                handlers: TaskTracker::new(),
            }),
        }
    }

    /// Hold the webhook response until the delivery has been appended
    /// (and fsynced, under `Durability::EveryWrite`).
    pub fn with_ack_after_write(self, ack_after_write: bool) -> Self {
        let inner = Arc::unwrap_or_clone(self.inner);
        Self {
            inner: Arc::new(Inner {
                ack_after_write,
                ..inner
            }),
        }
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.inner.ingestor
    }

    pub fn systems(&self) -> &Systems {
        &self.inner.systems
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn ack_after_write(&self) -> bool {
        self.inner.ack_after_write
    }

    /// Run webhook work that outlives its response. Shutdown waits for it
    /// in [`AppState::wait_for_handlers`].
    pub fn spawn_handler<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handlers.spawn(work);
    }

    /// Webhook work still running.
    pub fn handlers_in_flight(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Refuse new handler tasks and wait up to `grace` for running ones.
    /// Returns false if some were still running when the grace ran out.
    pub async fn wait_for_handlers(&self, grace: Duration) -> bool {
        let handlers = &self.inner.handlers;
        handlers.close();
        tokio::time::timeout(grace, handlers.wait()).await.is_ok()
    }
}
