//! Shared state of one remote subscription.
//!
//! A [`LiveResource`] is what the registry caches per key: it owns the
//! backend feed, writes the snapshot into the data tree at the key's
//! canonical path and pumps change events into that path until it is torn
//! down. Consumers never touch it directly; their slots link to its paths.

use crate::config::SyncConfig;
use crate::error::Result;
use crate::key::{ResourceKey, ResourceKind};
use crate::registry::Teardown;
use crate::remote::{ChangeEvent, RemoteClient, RemoteDoc, Snapshot, SubscriptionHandle};
use crate::tree::DataTree;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// What a live resource subscribes to.
#[derive(Debug, Clone)]
pub enum RemoteTarget {
    Document { collection: String, id: String },
    Query { collection: String, query: Value },
    Aggregate { collection: String, query: Value },
}

/// Where a live resource publishes into the tree.
#[derive(Debug, Clone)]
struct Paths {
    data: String,
    ids: Option<String>,
}

pub struct LiveResource {
    key: ResourceKey,
    paths: Paths,
    tree: DataTree,
    handle: Box<dyn SubscriptionHandle>,
    pump: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for LiveResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveResource")
            .field("key", &self.key)
            .field("path", &self.paths.data)
            .finish_non_exhaustive()
    }
}

/// The tree path holding a query's ordered document ids.
pub fn ids_path(path: &str) -> String {
    format!("{}#ids", path)
}

impl LiveResource {
    /// Subscribe, publish the snapshot and start pumping changes.
    pub async fn open(
        client: Arc<dyn RemoteClient>,
        key: ResourceKey,
        target: RemoteTarget,
        tree: DataTree,
        config: Arc<SyncConfig>,
    ) -> Result<Arc<Self>> {
        let feed = match &target {
            RemoteTarget::Document { collection, id } => {
                client.subscribe_document(collection, id).await?
            }
            RemoteTarget::Query { collection, query }
            | RemoteTarget::Aggregate { collection, query } => {
                client.subscribe_query(collection, query).await?
            }
        };

        let path = key.tree_path();
        let paths = Paths {
            ids: matches!(target, RemoteTarget::Query { .. }).then(|| ids_path(&path)),
            data: path,
        };
        let kind = key.kind();

        tree.scheduler().batch(|| write_snapshot(&tree, &paths, kind, feed.snapshot));
        tracing::debug!("opened live resource {} at {}", key, paths.data);

        let pump = tokio::spawn(pump_events(
            feed.events,
            tree.clone(),
            paths.clone(),
            kind,
            config,
        ));

        Ok(Arc::new(Self {
            key,
            paths,
            tree,
            handle: feed.handle,
            pump: Mutex::new(Some(pump.abort_handle())),
        }))
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Canonical path of the published value.
    pub fn path(&self) -> &str {
        &self.paths.data
    }

    /// Path of the ordered ids, for document queries.
    pub fn ids_path(&self) -> Option<&str> {
        self.paths.ids.as_deref()
    }
}

impl Teardown for LiveResource {
    fn teardown(&self) -> Result<()> {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }

        self.tree.scheduler().batch(|| {
            self.tree.clear(&self.paths.data);
            if let Some(ids) = &self.paths.ids {
                self.tree.clear(ids);
            }
        });

        self.handle.unsubscribe()
    }
}

fn doc_values(docs: &[RemoteDoc]) -> Vec<Value> {
    docs.iter().map(|doc| doc.data.clone()).collect()
}

fn doc_ids(docs: &[RemoteDoc]) -> Vec<Value> {
    docs.iter().map(|doc| Value::String(doc.id.clone())).collect()
}

fn write_snapshot(tree: &DataTree, paths: &Paths, kind: ResourceKind, snapshot: Snapshot) {
    match (kind, snapshot) {
        (ResourceKind::QueryAggregate, Snapshot::Query { extra, .. }) => {
            tree.set(&paths.data, extra.unwrap_or(Value::Null));
        }
        (_, Snapshot::Query { docs, .. }) => {
            tree.set(&paths.data, Value::Array(doc_values(&docs)));
            if let Some(ids) = &paths.ids {
                tree.set(ids, Value::Array(doc_ids(&docs)));
            }
        }
        (_, Snapshot::Document(value)) => {
            tree.set(&paths.data, value);
        }
    }
}

/// Apply events until the feed closes. Events already queued when the
/// pump wakes are applied in the same batch.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    tree: DataTree,
    paths: Paths,
    kind: ResourceKind,
    config: Arc<SyncConfig>,
) {
    while let Some(first) = events.recv().await {
        let mut pending = vec![first];
        while let Ok(event) = events.try_recv() {
            pending.push(event);
        }

        tree.scheduler().batch(|| {
            for event in pending {
                apply_event(&tree, &paths, kind, &config, event);
            }
        });
    }
    tracing::debug!("feed for {} closed", paths.data);
}

fn splice_both(tree: &DataTree, paths: &Paths, index: usize, remove: usize, docs: &[RemoteDoc]) {
    if let Err(err) = tree.splice(&paths.data, index, remove, doc_values(docs)) {
        tracing::warn!("dropping change for {}: {}", paths.data, err);
    }
    if let Some(ids) = &paths.ids {
        if let Err(err) = tree.splice(ids, index, remove, doc_ids(docs)) {
            tracing::warn!("dropping change for {}: {}", ids, err);
        }
    }
}

fn apply_event(
    tree: &DataTree,
    paths: &Paths,
    kind: ResourceKind,
    config: &SyncConfig,
    event: ChangeEvent,
) {
    match (kind, event) {
        (ResourceKind::Query, ChangeEvent::Insert { index, docs }) => {
            splice_both(tree, paths, index, 0, &docs);
        }
        (ResourceKind::Query, ChangeEvent::Remove { index, docs }) => {
            splice_both(tree, paths, index, docs.len(), &[]);
        }
        (ResourceKind::Query, ChangeEvent::Move { from, to, docs }) => {
            splice_both(tree, paths, from, docs.len(), &[]);
            splice_both(tree, paths, to, 0, &docs);
        }
        (ResourceKind::QueryAggregate, ChangeEvent::ExtraChanged { extra }) => {
            tree.set(&paths.data, extra);
        }
        (ResourceKind::Query, ChangeEvent::DocChanged { id, value, field }) => {
            if !is_ignored(config, paths, field.as_deref()) {
                replace_doc(tree, paths, &id, value);
            }
        }
        (ResourceKind::Doc, ChangeEvent::ValueChanged { value, field }) => {
            if !is_ignored(config, paths, field.as_deref()) {
                tree.set(&paths.data, value);
            }
        }
        (ResourceKind::QueryAggregate, _)
        | (ResourceKind::Query, ChangeEvent::ExtraChanged { .. }) => {}
        (kind, event) => {
            tracing::debug!("unexpected {:?} event for {} resource {}", event, kind, paths.data);
        }
    }
}

fn is_ignored(config: &SyncConfig, paths: &Paths, field: Option<&str>) -> bool {
    match field {
        Some(field) if config.is_ignored_field(field) => {
            tracing::trace!("ignoring change to {} on {}", field, paths.data);
            true
        }
        _ => false,
    }
}

/// Overwrite every result entry whose id is `id`, found through the ids
/// array kept alongside the results.
fn replace_doc(tree: &DataTree, paths: &Paths, id: &str, value: Value) {
    let Some(ids_path) = &paths.ids else {
        return;
    };
    let positions: Vec<usize> = match tree.get(ids_path) {
        Some(Value::Array(ids)) => ids
            .iter()
            .enumerate()
            .filter(|(_, candidate)| candidate.as_str() == Some(id))
            .map(|(index, _)| index)
            .collect(),
        _ => Vec::new(),
    };
    if positions.is_empty() {
        tracing::debug!("change to {} which is not in {}", id, paths.data);
        return;
    }
    for index in positions {
        if let Err(err) = tree.splice(&paths.data, index, 1, vec![value.clone()]) {
            tracing::warn!("dropping change to {} in {}: {}", id, paths.data, err);
        }
    }
}
