//! Drain workers: move queued envelopes into sinks at a bounded rate.
//!
//! One worker runs per `(object type, sink)` assignment and reads the
//! object's queue as a consumer named after the sink. Each tick it peeks
//! up to `batch_size` envelopes, hands them to the sink in one
//! `write_batch`, and advances its cursor past exactly those envelopes once
//! the write succeeds. A failed write leaves the queue untouched and pushes the next
//! tick out with exponential backoff.
//!
//! Shutdown is observed between ticks only; a batch that is being written
//! always completes (or times out) first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice_core::metrics::increment_labeled;
use sluice_core::{Envelope, SystemInfo};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::queue::{Queue, QueueSet};
use crate::system::SinkAdapter;

/// Deadline for one sink `write_batch`.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// First retry delay after a failed write.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff is capped at this many push intervals.
const BACKOFF_CAP_FACTOR: u32 = 8;

/// One object type drained into one sink.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Assignment {
    pub object: String,
    pub sink: String,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.object, self.sink)
    }
}

/// Decide which sink drains which object type.
///
/// A sink with no `objects` list drains every schema key. Several sinks may
/// drain one object type; each reads the queue through its own cursor. A
/// sink that names an object type with no schema is rejected.
pub fn plan_assignments<'a>(
    objects: impl IntoIterator<Item = &'a str>,
    sinks: impl IntoIterator<Item = &'a SystemInfo>,
) -> Result<Vec<Assignment>> {
    let objects: Vec<&str> = objects.into_iter().collect();
    let mut plan = Vec::new();

    for sink in sinks {
        if let Some(listed) = &sink.objects {
            for object in listed {
                if !objects.contains(&object.as_str()) {
                    return Err(Error::Config(format!(
                        "sink '{}' drains '{object}', which has no schema",
                        sink.name
                    )));
                }
            }
        }

        plan.extend(objects.iter().filter(|o| sink.drains(o)).map(|object| Assignment {
            object: object.to_string(),
            sink: sink.name.clone(),
        }));
    }

    plan.sort();
    plan.dedup();
    Ok(plan)
}

/// Queue consumers implied by a plan: the sinks draining each object type.
pub fn consumers_by_object(assignments: &[Assignment]) -> BTreeMap<String, Vec<String>> {
    let mut consumers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for assignment in assignments {
        consumers
            .entry(assignment.object.clone())
            .or_default()
            .push(assignment.sink.clone());
    }
    consumers
}

/// Exponential backoff: `min(base * 2^(k-1), push_frequency * 8)` after the
/// k-th consecutive failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(push_frequency: Duration) -> Self {
        Self {
            base: BACKOFF_BASE,
            cap: push_frequency.saturating_mul(BACKOFF_CAP_FACTOR),
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 2u32.saturating_pow(self.failures - 1);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Drains one queue into one sink.
pub struct DrainWorker {
    object: String,
    queue: Arc<Queue<Envelope>>,
    sink: Arc<dyn SinkAdapter>,
    write_timeout: Duration,
}

impl DrainWorker {
    pub fn new(object: impl Into<String>, queue: Arc<Queue<Envelope>>, sink: Arc<dyn SinkAdapter>) -> Self {
        Self {
            object: object.into(),
            queue,
            sink,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Write and dequeue at most one batch. Returns how many envelopes left
    /// the queue.
    pub async fn drain_once(&self) -> Result<usize> {
        let queue = Arc::clone(&self.queue);
        let consumer = self.sink.name().to_string();
        let limit = self.sink.batch_size().max(1);
        let items = blocking(move || Ok(queue.peek_batch_as(&consumer, limit)?)).await?;
        if items.is_empty() {
            return Ok(0);
        }

        let sink = self.sink.name();
        let started = Instant::now();
        match tokio::time::timeout(self.write_timeout, self.sink.write_batch(&self.object, &items)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "write of {} '{}' items to '{sink}' after {:?}",
                    items.len(),
                    self.object,
                    self.write_timeout
                )));
            }
        }
        metrics::histogram!("drain_write_duration_seconds", "sink" => sink.to_string())
            .record(started.elapsed().as_secs_f64());

        let count = items.len();
        let queue = Arc::clone(&self.queue);
        let consumer = sink.to_string();
        let removed = blocking(move || Ok(queue.dequeue_batch_as(&consumer, count)?)).await?;
        increment_labeled("drain_items_written_total", "sink", sink, removed.len() as u64);
        debug!(object = %self.object, sink = %sink, count = removed.len(), "batch drained");
        Ok(removed.len())
    }

    /// Tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let push_frequency = self.sink.push_frequency();
        let sink = self.sink.name().to_string();
        let mut backoff = Backoff::new(push_frequency);

        info!(object = %self.object, sink = %sink, every = ?push_frequency, "drain worker started");

        while !shutdown.is_cancelled() {
            let delay = match self.drain_once().await {
                Ok(_) => {
                    backoff.reset();
                    push_frequency
                }
                Err(e) => {
                    let delay = backoff.fail();
                    increment_labeled("drain_write_errors_total", "sink", &sink, 1);
                    error!(
                        object = %self.object,
                        sink = %sink,
                        attempt = backoff.failures(),
                        next_delay = ?delay,
                        error = %e,
                        "sink write failed, batch left queued"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(object = %self.object, sink = %sink, "drain worker stopped");
    }
}

/// The running set of drain workers.
pub struct Drainers {
    tasks: JoinSet<()>,
    names: Vec<String>,
    shutdown: CancellationToken,
}

impl Drainers {
    /// Start a worker for every assignment whose sink is in `sinks`.
    /// Assignments to sinks that never became ready are skipped.
    pub fn spawn<'a>(
        assignments: &[Assignment],
        queues: &QueueSet,
        sinks: impl IntoIterator<Item = &'a Arc<dyn SinkAdapter>>,
        shutdown: CancellationToken,
    ) -> Self {
        let sinks: BTreeMap<&str, &Arc<dyn SinkAdapter>> = sinks.into_iter().map(|s| (s.name(), s)).collect();
        let mut tasks = JoinSet::new();
        let mut names = Vec::new();

        for assignment in assignments {
            let Some(sink) = sinks.get(assignment.sink.as_str()) else {
                warn!(object = %assignment.object, sink = %assignment.sink, "sink unavailable, drain worker skipped");
                continue;
            };
            let Some(queue) = queues.get(&assignment.object) else {
                warn!(object = %assignment.object, "no queue for object, drain worker skipped");
                continue;
            };

            let worker = DrainWorker::new(&assignment.object, Arc::clone(queue), Arc::clone(sink));
            tasks.spawn(worker.run(shutdown.child_token()));
            names.push(assignment.to_string());
        }

        Self {
            tasks,
            names,
            shutdown,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Signal every worker and wait for in-flight batches to finish.
    /// Returns false if a worker panicked.
    pub async fn stop(mut self) -> bool {
        self.shutdown.cancel();
        let mut clean = true;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "drain worker panicked");
                clean = false;
            }
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueOptions;
    use crate::system::tests::MemorySink;
    use serde_json::json;
    use sluice_core::{Operation, SystemType};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn sink_info(name: &str, objects: Option<&[&str]>) -> SystemInfo {
        let mut info = SystemInfo::new(name, SystemType::Postgresql);
        info.objects = objects.map(|o| o.iter().map(|s| s.to_string()).collect());
        info
    }

    fn product(id: &str) -> Envelope {
        Envelope::from_value("product", Operation::Upsert, json!({"id": id, "name": "X"})).unwrap()
    }

    fn queue_with(dir: &std::path::Path, ids: &[&str]) -> Arc<Queue<Envelope>> {
        let queue =
            Queue::open_with_consumers(dir, "product", QueueOptions::default(), &["warehouse", "stuck"])
                .unwrap();
        for id in ids {
            queue.enqueue(&product(id)).unwrap();
        }
        Arc::new(queue)
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1));
        let delays: Vec<u64> = (0..6).map(|_| backoff.fail().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);

        backoff.reset();
        assert_eq!(backoff.fail(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_cap_below_base() {
        let mut backoff = Backoff::new(Duration::from_millis(100));
        assert_eq!(backoff.fail(), Duration::from_millis(800));
    }

    #[test]
    fn test_plan_default_sink_takes_everything() {
        let sinks = [sink_info("warehouse", None)];
        let plan = plan_assignments(["price", "product"], &sinks).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|a| a.sink == "warehouse"));
    }

    #[test]
    fn test_plan_split_by_objects() {
        let sinks = [
            sink_info("pg", Some(&["product"])),
            sink_info("sf", Some(&["price"])),
        ];
        let plan = plan_assignments(["price", "product"], &sinks).unwrap();
        assert_eq!(
            plan.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["price->sf", "product->pg"]
        );
    }

    #[test]
    fn test_plan_two_sinks_share_an_object() {
        let sinks = [sink_info("pg", None), sink_info("sf", Some(&["product"]))];
        let plan = plan_assignments(["price", "product"], &sinks).unwrap();
        assert_eq!(
            plan.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["price->pg", "product->pg", "product->sf"]
        );

        let consumers = consumers_by_object(&plan);
        assert_eq!(consumers["product"], vec!["pg", "sf"]);
        assert_eq!(consumers["price"], vec!["pg"]);
    }

    #[test]
    fn test_plan_rejects_unknown_object() {
        let sinks = [sink_info("pg", Some(&["coupon"]))];
        assert!(matches!(plan_assignments(["product"], &sinks), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_drain_once_writes_then_dequeues() {
        let tmp = TempDir::new().unwrap();
        let queue = queue_with(tmp.path(), &["a", "b", "c"]);
        let sink = Arc::new(MemorySink::new("warehouse").with_info(|i| i.batch_size = 2));
        let worker = DrainWorker::new("product", Arc::clone(&queue), sink.clone());

        assert_eq!(worker.drain_once().await.unwrap(), 2);
        assert_eq!(sink.written_ids(), vec!["a", "b"]);
        assert_eq!(queue.pending_for("warehouse"), Some(1));

        assert_eq!(worker.drain_once().await.unwrap(), 1);
        assert_eq!(worker.drain_once().await.unwrap(), 0);
        assert_eq!(sink.written_ids(), vec!["a", "b", "c"]);
        assert_eq!(queue.pending_for("warehouse"), Some(0));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_queue_untouched() {
        let tmp = TempDir::new().unwrap();
        let queue = queue_with(tmp.path(), &["a", "b"]);
        let sink = Arc::new(MemorySink::new("warehouse").failing(1));
        let worker = DrainWorker::new("product", Arc::clone(&queue), sink.clone());

        assert!(worker.drain_once().await.is_err());
        assert_eq!(queue.pending_for("warehouse"), Some(2));
        assert!(sink.written_ids().is_empty());

        assert_eq!(worker.drain_once().await.unwrap(), 2);
        assert_eq!(sink.written_ids(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_until_written() {
        let tmp = TempDir::new().unwrap();
        let queue = queue_with(tmp.path(), &["a"]);
        let sink = Arc::new(
            MemorySink::new("warehouse")
                .with_info(|i| i.push_frequency = Duration::from_secs(10))
                .failing(3),
        );
        let shutdown = CancellationToken::new();
        let worker = DrainWorker::new("product", Arc::clone(&queue), sink.clone());
        let started = tokio::time::Instant::now();
        let task = tokio::spawn(worker.run(shutdown.clone()));

        while sink.written_ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // 1s + 2s + 4s of backoff before the fourth attempt.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(7), "{waited:?}");
        assert!(waited < Duration::from_secs(10), "{waited:?}");
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(sink.written_ids(), vec!["a"]);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(queue.pending_for("warehouse"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_keeps_items() {
        struct Stuck(SystemInfo);

        #[async_trait::async_trait]
        impl SinkAdapter for Stuck {
            fn info(&self) -> &SystemInfo {
                &self.0
            }
            async fn open_connection(&self) -> Result<()> {
                Ok(())
            }
            async fn write_batch(&self, _object: &str, _items: &[Envelope]) -> Result<()> {
                std::future::pending().await
            }
            async fn close(&self) {}
        }

        let tmp = TempDir::new().unwrap();
        let queue = queue_with(tmp.path(), &["a"]);
        let worker = DrainWorker::new(
            "product",
            Arc::clone(&queue),
            Arc::new(Stuck(sink_info("stuck", None))),
        );
        let err = worker.drain_once().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(queue.pending_for("stuck"), Some(1));
    }

    #[tokio::test]
    async fn test_drainers_skip_unavailable_sinks_and_stop() {
        let tmp = TempDir::new().unwrap();
        let assignments = vec![
            Assignment {
                object: "product".to_string(),
                sink: "warehouse".to_string(),
            },
            Assignment {
                object: "product".to_string(),
                sink: "missing".to_string(),
            },
        ];
        let queues = QueueSet::open_with_consumers(
            tmp.path(),
            ["product"],
            QueueOptions::default(),
            &consumers_by_object(&assignments),
        )
        .unwrap();
        let queue = Arc::clone(queues.get("product").unwrap());
        queue.enqueue(&product("a")).unwrap();

        let sink: Arc<dyn SinkAdapter> = Arc::new(MemorySink::new("warehouse"));
        let drainers = Drainers::spawn(&assignments, &queues, [&sink], CancellationToken::new());
        assert_eq!(drainers.names(), ["product->warehouse"]);

        while queue.pending_for("warehouse") != Some(0) {
            tokio::task::yield_now().await;
        }
        assert!(drainers.stop().await);
        // Retained for the sink that never came up.
        assert_eq!(queue.pending_for("missing"), Some(1));
    }

    #[tokio::test]
    async fn test_two_sinks_each_receive_every_envelope() {
        let tmp = TempDir::new().unwrap();
        let sinks = [sink_info("lake", None), sink_info("warehouse", None)];
        let plan = plan_assignments(["product"], &sinks).unwrap();
        let queues = QueueSet::open_with_consumers(
            tmp.path(),
            ["product"],
            QueueOptions::with_segment_size(2),
            &consumers_by_object(&plan),
        )
        .unwrap();
        let queue = Arc::clone(queues.get("product").unwrap());
        for id in ["a", "b", "c"] {
            queue.enqueue(&product(id)).unwrap();
        }

        let lake = Arc::new(MemorySink::new("lake"));
        let warehouse = Arc::new(MemorySink::new("warehouse").with_info(|i| i.batch_size = 1));
        let lake_worker = DrainWorker::new("product", Arc::clone(&queue), lake.clone());
        let warehouse_worker = DrainWorker::new("product", Arc::clone(&queue), warehouse.clone());

        assert_eq!(lake_worker.drain_once().await.unwrap(), 3);
        assert_eq!(lake.written_ids(), vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 3);

        for _ in 0..3 {
            assert_eq!(warehouse_worker.drain_once().await.unwrap(), 1);
        }
        assert_eq!(warehouse.written_ids(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }
}
