//! The unit of work that flows from a source webhook to a sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// JSON object type used for decoded event payloads.
pub type Object = Map<String, Value>;

/// What a sink should do with an envelope's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Insert the object, or update it if the conflict key already exists.
    Upsert,
    /// Remove the object identified by the conflict key.
    Delete,
}

impl Operation {
    /// Map an upstream action verb (`created`, `updated`, `deleted`) to an operation.
    ///
    /// Returns `None` for verbs that carry no data change.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "created" | "updated" => Some(Self::Upsert),
            "deleted" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Lowercase name used in logs and the wire format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

/// A single queued item.
///
/// Envelopes are self-describing: the object type travels with the payload
/// so a segment file can be inspected without the schema directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema key (object type) this payload was validated against.
    pub object: String,

    /// Requested change.
    pub operation: Operation,

    /// When the source webhook delivered the event.
    pub received_at: DateTime<Utc>,

    /// Canonical, schema-validated object.
    pub payload: Object,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(object: impl Into<String>, operation: Operation, payload: Object) -> Self {
        Self {
            object: object.into(),
            operation,
            received_at: Utc::now(),
            payload,
        }
    }

    /// Build an envelope from an arbitrary JSON value, which must be an object.
    pub fn from_value(object: impl Into<String>, operation: Operation, value: Value) -> Result<Self> {
        let object = object.into();
        match value {
            Value::Object(payload) => Ok(Self::new(object, operation, payload)),
            _ => Err(Error::PayloadNotObject { object }),
        }
    }

    /// Look up a top-level payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_from_action() {
        assert_eq!(Operation::from_action("created"), Some(Operation::Upsert));
        assert_eq!(Operation::from_action("updated"), Some(Operation::Upsert));
        assert_eq!(Operation::from_action("deleted"), Some(Operation::Delete));
        assert_eq!(Operation::from_action("succeeded"), None);
    }

    #[test]
    fn test_envelope_wire_format() {
        let env = Envelope::from_value("product", Operation::Upsert, json!({"id": "p1"})).unwrap();
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["object"], "product");
        assert_eq!(value["operation"], "upsert");
        assert_eq!(value["payload"]["id"], "p1");
        assert!(value["received_at"].is_string());
    }

    #[test]
    fn test_envelope_rejects_non_object() {
        let err = Envelope::from_value("product", Operation::Upsert, json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::PayloadNotObject { .. }));
    }
}
