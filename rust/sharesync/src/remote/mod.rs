//! Boundary to the real-time backend client.
//!
//! A backend hands out one [`RemoteFeed`] per subscription: the current
//! snapshot, a channel of structured change events, and a handle that ends
//! the subscription. The feed's channel is owned by exactly one live
//! resource, so listener lifetime follows resource lifetime.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::MemoryBackend;

/// One document of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDoc {
    pub id: String,
    pub data: Value,
}

impl RemoteDoc {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert {
        index: usize,
        docs: Vec<RemoteDoc>,
    },
    Remove {
        index: usize,
        docs: Vec<RemoteDoc>,
    },
    Move {
        from: usize,
        to: usize,
        docs: Vec<RemoteDoc>,
    },
    ExtraChanged {
        extra: Value,
    },
    /// The document's value changed. `field` names the top-level field the
    /// change touched, when the backend knows it.
    ValueChanged {
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// A document inside a query's results changed. It stays at every
    /// position it already holds.
    DocChanged {
        id: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Document(Value),
    Query {
        docs: Vec<RemoteDoc>,
        extra: Option<Value>,
    },
}

pub trait SubscriptionHandle: Send + Sync {
    /// Tell the backend this subscription is no longer needed. The event
    /// channel closes afterwards.
    fn unsubscribe(&self) -> Result<()>;
}

pub struct RemoteFeed {
    pub snapshot: Snapshot,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
    pub handle: Box<dyn SubscriptionHandle>,
}

impl std::fmt::Debug for RemoteFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFeed")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    async fn subscribe_document(&self, collection: &str, id: &str) -> Result<RemoteFeed>;

    async fn subscribe_query(&self, collection: &str, query: &Value) -> Result<RemoteFeed>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_event_parse() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "type": "insert",
            "index": 2,
            "docs": [{"id": "x", "data": {"name": "X"}}]
        }))
        .unwrap();

        assert_eq!(
            event,
            ChangeEvent::Insert {
                index: 2,
                docs: vec![RemoteDoc::new("x", json!({"name": "X"}))],
            }
        );
    }

    #[test]
    fn test_value_changed_without_field() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "type": "value_changed",
            "value": null
        }))
        .unwrap();

        assert_eq!(
            event,
            ChangeEvent::ValueChanged {
                value: Value::Null,
                field: None
            }
        );
    }
}
