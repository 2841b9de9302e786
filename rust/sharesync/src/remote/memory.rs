//! In-process backend.
//!
//! Holds documents and query results in memory and pushes change events to
//! every open feed. Query results are scripted by the caller (there is no
//! query engine); the backend only keeps them consistent with the events it
//! emits. Used by tests and the demo, and usable as a local stand-in for a
//! real backend.

use super::{ChangeEvent, RemoteClient, RemoteDoc, RemoteFeed, Snapshot, SubscriptionHandle};
use crate::error::{Result, SyncError};
use crate::key::canonical_params;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FeedTarget {
    Document { collection: String, id: String },
    Query { collection: String, query: String },
}

#[derive(Debug, Default, Clone)]
struct QueryData {
    docs: Vec<RemoteDoc>,
    extra: Option<Value>,
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<(String, String), Value>,
    queries: HashMap<(String, String), QueryData>,
    feeds: HashMap<u64, (FeedTarget, mpsc::UnboundedSender<ChangeEvent>)>,
    next_feed: u64,
    failures: HashMap<String, String>,
    latency: Option<Duration>,
    subscribe_calls: HashMap<FeedTarget, usize>,
    unsubscribe_calls: usize,
}

impl MemoryState {
    fn emit(&mut self, target: &FeedTarget, event: ChangeEvent) {
        self.feeds.retain(|_, (feed_target, tx)| {
            if feed_target != target {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }

    /// Copy a document's new value into every query result holding it and
    /// tell those queries' feeds.
    fn propagate(&mut self, collection: &str, id: &str, value: &Value, field: Option<&str>) {
        let mut touched = Vec::new();
        for ((query_collection, query), data) in self.queries.iter_mut() {
            if query_collection != collection {
                continue;
            }
            let mut hit = false;
            for doc in data.docs.iter_mut().filter(|doc| doc.id == id) {
                doc.data = value.clone();
                hit = true;
            }
            if hit {
                touched.push(FeedTarget::Query {
                    collection: query_collection.clone(),
                    query: query.clone(),
                });
            }
        }
        for target in touched {
            self.emit(
                &target,
                ChangeEvent::DocChanged {
                    id: id.to_string(),
                    value: value.clone(),
                    field: field.map(str::to_string),
                },
            );
        }
    }

    fn open_feed(&mut self, target: FeedTarget) -> (u64, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_feed += 1;
        let id = self.next_feed;
        *self.subscribe_calls.entry(target.clone()).or_insert(0) += 1;
        self.feeds.insert(id, (target, tx));
        (id, rx)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn query_key(collection: &str, query: &Value) -> Result<(String, String)> {
        Ok((collection.to_string(), canonical_params(query)?))
    }

    fn query_target(collection: &str, query: &Value) -> Result<FeedTarget> {
        let (collection, query) = Self::query_key(collection, query)?;
        Ok(FeedTarget::Query { collection, query })
    }

    /// Delay every subscribe call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Make subscriptions to `collection` fail with `reason`.
    pub fn fail_collection(&self, collection: impl Into<String>, reason: impl Into<String>) {
        self.lock().failures.insert(collection.into(), reason.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn set_document(&self, collection: &str, id: &str, value: Value) {
        let mut state = self.lock();
        state
            .documents
            .insert((collection.to_string(), id.to_string()), value.clone());
        let target = FeedTarget::Document {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        state.propagate(collection, id, &value, None);
        state.emit(&target, ChangeEvent::ValueChanged { value, field: None });
    }

    /// Set one top-level field of a document object. Query results holding
    /// the document see the change too.
    pub fn update_field(&self, collection: &str, id: &str, field: &str, value: Value) {
        let mut state = self.lock();
        let doc = state
            .documents
            .entry((collection.to_string(), id.to_string()))
            .or_insert_with(|| Value::Object(Default::default()));
        if !doc.is_object() {
            *doc = Value::Object(Default::default());
        }
        if let Some(object) = doc.as_object_mut() {
            object.insert(field.to_string(), value);
        }
        let current = doc.clone();
        let target = FeedTarget::Document {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        state.propagate(collection, id, &current, Some(field));
        state.emit(
            &target,
            ChangeEvent::ValueChanged {
                value: current,
                field: Some(field.to_string()),
            },
        );
    }

    /// Query membership is scripted, so results holding the document keep
    /// their last value until `query_remove`.
    pub fn delete_document(&self, collection: &str, id: &str) {
        let mut state = self.lock();
        state
            .documents
            .remove(&(collection.to_string(), id.to_string()));
        let target = FeedTarget::Document {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        state.emit(
            &target,
            ChangeEvent::ValueChanged {
                value: Value::Null,
                field: None,
            },
        );
    }

    /// Seed the results a query subscription starts from.
    pub fn set_query(
        &self,
        collection: &str,
        query: &Value,
        docs: Vec<RemoteDoc>,
        extra: Option<Value>,
    ) -> Result<()> {
        let key = Self::query_key(collection, query)?;
        self.lock().queries.insert(key, QueryData { docs, extra });
        Ok(())
    }

    pub fn query_insert(
        &self,
        collection: &str,
        query: &Value,
        index: usize,
        docs: Vec<RemoteDoc>,
    ) -> Result<()> {
        self.with_query(collection, query, |data| {
            let at = index.min(data.docs.len());
            data.docs.splice(at..at, docs.iter().cloned());
            ChangeEvent::Insert { index: at, docs }
        })
    }

    pub fn query_remove(
        &self,
        collection: &str,
        query: &Value,
        index: usize,
        count: usize,
    ) -> Result<()> {
        self.with_query(collection, query, |data| {
            let at = index.min(data.docs.len());
            let end = at + count.min(data.docs.len() - at);
            let docs: Vec<RemoteDoc> = data.docs.drain(at..end).collect();
            ChangeEvent::Remove { index: at, docs }
        })
    }

    pub fn query_move(
        &self,
        collection: &str,
        query: &Value,
        from: usize,
        to: usize,
        count: usize,
    ) -> Result<()> {
        self.with_query(collection, query, |data| {
            let from = from.min(data.docs.len());
            let end = from + count.min(data.docs.len() - from);
            let docs: Vec<RemoteDoc> = data.docs.drain(from..end).collect();
            let to = to.min(data.docs.len());
            data.docs.splice(to..to, docs.iter().cloned());
            ChangeEvent::Move { from, to, docs }
        })
    }

    pub fn set_extra(&self, collection: &str, query: &Value, extra: Value) -> Result<()> {
        self.with_query(collection, query, |data| {
            data.extra = Some(extra.clone());
            ChangeEvent::ExtraChanged { extra }
        })
    }

    fn with_query(
        &self,
        collection: &str,
        query: &Value,
        apply: impl FnOnce(&mut QueryData) -> ChangeEvent,
    ) -> Result<()> {
        let key = Self::query_key(collection, query)?;
        let target = FeedTarget::Query {
            collection: key.0.clone(),
            query: key.1.clone(),
        };
        let mut state = self.lock();
        let data = state.queries.entry(key).or_default();
        let event = apply(data);
        state.emit(&target, event);
        Ok(())
    }

    pub fn document_subscribe_calls(&self, collection: &str, id: &str) -> usize {
        let target = FeedTarget::Document {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        self.lock().subscribe_calls.get(&target).copied().unwrap_or(0)
    }

    pub fn query_subscribe_calls(&self, collection: &str, query: &Value) -> usize {
        let Ok(target) = Self::query_target(collection, query) else {
            return 0;
        };
        self.lock().subscribe_calls.get(&target).copied().unwrap_or(0)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.lock().unsubscribe_calls
    }

    pub fn active_feeds(&self) -> usize {
        self.lock().feeds.len()
    }

    async fn before_subscribe(&self, collection: &str) -> Result<()> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(reason) = self.lock().failures.get(collection) {
            return Err(SyncError::subscription(collection, reason));
        }
        Ok(())
    }

    fn handle(&self, feed: u64) -> Box<dyn SubscriptionHandle> {
        Box::new(MemoryHandle {
            state: Arc::downgrade(&self.state),
            feed,
        })
    }
}

#[async_trait]
impl RemoteClient for MemoryBackend {
    async fn subscribe_document(&self, collection: &str, id: &str) -> Result<RemoteFeed> {
        self.before_subscribe(collection).await?;

        let (feed, events, value) = {
            let mut state = self.lock();
            let value = state
                .documents
                .get(&(collection.to_string(), id.to_string()))
                .cloned()
                .unwrap_or(Value::Null);
            let (feed, events) = state.open_feed(FeedTarget::Document {
                collection: collection.to_string(),
                id: id.to_string(),
            });
            (feed, events, value)
        };

        Ok(RemoteFeed {
            snapshot: Snapshot::Document(value),
            events,
            handle: self.handle(feed),
        })
    }

    async fn subscribe_query(&self, collection: &str, query: &Value) -> Result<RemoteFeed> {
        self.before_subscribe(collection).await?;
        let key = Self::query_key(collection, query)?;

        let (feed, events, data) = {
            let mut state = self.lock();
            let data = state.queries.get(&key).cloned().unwrap_or_default();
            let (collection, query) = key;
            let (feed, events) = state.open_feed(FeedTarget::Query { collection, query });
            (feed, events, data)
        };

        Ok(RemoteFeed {
            snapshot: Snapshot::Query {
                docs: data.docs,
                extra: data.extra,
            },
            events,
            handle: self.handle(feed),
        })
    }
}

struct MemoryHandle {
    state: Weak<Mutex<MemoryState>>,
    feed: u64,
}

impl SubscriptionHandle for MemoryHandle {
    fn unsubscribe(&self) -> Result<()> {
        let Some(state) = self.state.upgrade() else {
            return Err(SyncError::teardown(self.feed, "backend dropped"));
        };
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.feeds.remove(&self.feed).is_some() {
            state.unsubscribe_calls += 1;
        }
        Ok(())
    }
}
