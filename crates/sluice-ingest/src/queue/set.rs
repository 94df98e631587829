use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use sluice_core::Envelope;
use tracing::warn;

use super::{Queue, QueueOptions, QueueResult};

/// Every open envelope queue, keyed by object type.
#[derive(Debug, Clone, Default)]
pub struct QueueSet {
    queues: BTreeMap<String, Arc<Queue<Envelope>>>,
}

impl QueueSet {
    /// Open one queue per key under `dir`. Any failure aborts the whole set.
    pub fn open<'a>(
        dir: &Path,
        keys: impl IntoIterator<Item = &'a str>,
        options: QueueOptions,
    ) -> QueueResult<Self> {
        let mut set = Self::default();
        for key in keys {
            let queue = Queue::open(dir, key, options)?;
            set.queues.insert(key.to_string(), Arc::new(queue));
        }
        Ok(set)
    }

    /// Open one queue per key, each read by the consumers listed for it in
    /// `consumers`. A key with no entry gets only the default consumer.
    pub fn open_with_consumers<'a>(
        dir: &Path,
        keys: impl IntoIterator<Item = &'a str>,
        options: QueueOptions,
        consumers: &BTreeMap<String, Vec<String>>,
    ) -> QueueResult<Self> {
        let mut set = Self::default();
        for key in keys {
            let queue = match consumers.get(key) {
                Some(names) if !names.is_empty() => {
                    Queue::open_with_consumers(dir, key, options, names.as_slice())?
                }
                _ => Queue::open(dir, key, options)?,
            };
            set.queues.insert(key.to_string(), Arc::new(queue));
        }
        Ok(set)
    }

    pub fn get(&self, object: &str) -> Option<&Arc<Queue<Envelope>>> {
        self.queues.get(object)
    }

    pub fn contains(&self, object: &str) -> bool {
        self.queues.contains_key(object)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Queue<Envelope>>)> {
        self.queues.iter().map(|(k, q)| (k.as_str(), q))
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Pending item count per object type, for the slowest consumer.
    pub fn lengths(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(key, queue)| (key.clone(), queue.len()))
            .collect()
    }

    /// Close every queue, returning the first failure after trying them all.
    pub fn close_all(&self) -> QueueResult<()> {
        let mut first_error = None;
        for (key, queue) in &self.queues {
            if let Err(e) = queue.close() {
                warn!(object = %key, error = %e, "failed to close queue");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::Operation;
    use tempfile::TempDir;

    fn envelope(id: &str) -> Envelope {
        Envelope::from_value("product", Operation::Upsert, json!({ "id": id })).unwrap()
    }

    #[test]
    fn test_open_and_lengths() {
        let tmp = TempDir::new().unwrap();
        let set = QueueSet::open(tmp.path(), ["price", "product"], QueueOptions::default()).unwrap();

        assert_eq!(set.len(), 2);
        assert!(tmp.path().join("product").is_dir());
        assert!(tmp.path().join("price").is_dir());

        set.get("product").unwrap().enqueue(&envelope("p1")).unwrap();
        let lengths = set.lengths();
        assert_eq!(lengths["product"], 1);
        assert_eq!(lengths["price"], 0);
        assert!(set.get("coupon").is_none());
    }

    #[test]
    fn test_close_all_then_reopen() {
        let tmp = TempDir::new().unwrap();
        let set = QueueSet::open(tmp.path(), ["product"], QueueOptions::default()).unwrap();
        set.get("product").unwrap().enqueue(&envelope("p1")).unwrap();
        set.close_all().unwrap();
        set.close_all().unwrap();
        drop(set);

        let set = QueueSet::open(tmp.path(), ["product"], QueueOptions::default()).unwrap();
        let item = set.get("product").unwrap().peek().unwrap().unwrap();
        assert_eq!(item.field("id"), Some(&json!("p1")));
    }

    #[test]
    fn test_open_with_consumers_per_key() {
        let tmp = TempDir::new().unwrap();
        let consumers = BTreeMap::from([(
            "product".to_string(),
            vec!["lake".to_string(), "warehouse".to_string()],
        )]);
        let set = QueueSet::open_with_consumers(
            tmp.path(),
            ["price", "product"],
            QueueOptions::default(),
            &consumers,
        )
        .unwrap();

        assert_eq!(set.get("product").unwrap().consumers(), vec!["lake", "warehouse"]);
        assert_eq!(set.get("price").unwrap().consumers(), vec![""]);

        let product = set.get("product").unwrap();
        product.enqueue(&envelope("p1")).unwrap();
        product.dequeue_batch_as("lake", 1).unwrap();
        assert_eq!(set.lengths()["product"], 1);
    }
}
