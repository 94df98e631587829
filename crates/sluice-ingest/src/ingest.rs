//! Validate canonical objects and append them to their queue.

use std::sync::Arc;

use serde_json::Value;
use sluice_core::metrics::increment_labeled;
use sluice_core::{Envelope, Object, Operation};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::queue::QueueSet;
use crate::schema::SchemaRegistry;

/// The append capability handed to source adapters: read-only schemas plus
/// the queues they guard.
#[derive(Debug, Clone)]
pub struct Ingestor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    schemas: SchemaRegistry,
    queues: QueueSet,
}

impl Ingestor {
    pub fn new(schemas: SchemaRegistry, queues: QueueSet) -> Self {
        Self {
            inner: Arc::new(Inner { schemas, queues }),
        }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.inner.schemas
    }

    pub fn queues(&self) -> &QueueSet {
        &self.inner.queues
    }

    /// Validate `payload` against the schema for `object` and append it.
    ///
    /// Objects that fail validation are logged and never reach the queue.
    pub async fn ingest(&self, object: &str, operation: Operation, payload: Object) -> Result<()> {
        let (Some(schema), Some(queue)) = (self.schemas().get(object), self.queues().get(object))
        else {
            warn!(object = %object, "no schema for object type, dropping");
            metrics::counter!("ingest_events_dropped_total").increment(1);
            return Err(Error::UnknownObject(object.to_string()));
        };

        let value = Value::Object(payload);
        if let Err(e) = schema.validate(&value) {
            warn!(object = %object, error = %e, "dropping object: schema validation failed");
            increment_labeled("ingest_events_invalid_total", "object", object, 1);
            return Err(e);
        }

        let envelope = Envelope::from_value(object, operation, value)?;
        let queue = Arc::clone(queue);

        let appended = tokio::task::spawn_blocking(move || queue.enqueue(&envelope))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        match appended {
            Ok(()) => {
                increment_labeled("ingest_events_enqueued_total", "object", object, 1);
                debug!(object = %object, operation = operation.as_str(), "enqueued");
                Ok(())
            }
            Err(source) => {
                error!(object = %object, error = %source, "enqueue failed, dropping object");
                increment_labeled("ingest_enqueue_errors_total", "object", object, 1);
                Err(Error::Enqueue {
                    object: object.to_string(),
                    source,
                })
            }
        }
    }
}
