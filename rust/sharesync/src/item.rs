//! Per-consumer subscription handle.
//!
//! A [`SubscriptionItem`] walks `Initializing -> Attached -> Destroyed`
//! (or straight to `Destroyed` when cancelled mid-init). Remote kinds take
//! a reference through the registry during `init`, so every item that
//! finishes an acquire gives exactly one reference back, however late it
//! learns that it was cancelled.

use crate::client::ShareSync;
use crate::error::{Result, SyncError};
use crate::key::{
    ids_slot_name, AsyncCallSpec, ResourceKey, ResourceKind, ResourceSpec, SpecSource,
};
use crate::resource::{LiveResource, RemoteTarget};
use crate::tree::DataTree;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Initializing,
    Attached,
    /// Unref'd after being attached; may be attached again.
    Detached,
    Destroyed,
}

#[derive(Debug, Clone)]
enum ItemSource {
    Remote(RemoteTarget),
    Local { path: String },
    Value { value: Value },
    AsyncCall(AsyncCallSpec),
}

impl ItemSource {
    fn from_spec(kind: ResourceKind, source: SpecSource) -> Self {
        match source {
            SpecSource::Doc { collection, id } => {
                ItemSource::Remote(RemoteTarget::Document { collection, id })
            }
            SpecSource::Query { collection, query } if kind == ResourceKind::QueryAggregate => {
                ItemSource::Remote(RemoteTarget::Aggregate { collection, query })
            }
            SpecSource::Query { collection, query } => {
                ItemSource::Remote(RemoteTarget::Query { collection, query })
            }
            SpecSource::Local { path } => ItemSource::Local { path },
            SpecSource::Value { value } => ItemSource::Value { value },
            SpecSource::AsyncCall(spec) => ItemSource::AsyncCall(spec),
        }
    }
}

struct ItemInner {
    state: ItemState,
    ready: bool,
    /// Set while an init runs or after one succeeded.
    init_started: bool,
    resource: Option<Arc<LiveResource>>,
    result: Option<Value>,
}

pub struct SubscriptionItem {
    key: ResourceKey,
    slot: String,
    first: bool,
    source: ItemSource,
    sync: ShareSync,
    cancelled: CancellationToken,
    inner: Mutex<ItemInner>,
}

impl std::fmt::Debug for SubscriptionItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionItem")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SubscriptionItem {
    /// `first` is false for items that replace an earlier one in the same
    /// binding; only those are debounced.
    pub(crate) fn new(sync: ShareSync, spec: ResourceSpec, slot: String, first: bool) -> Arc<Self> {
        let kind = spec.kind();
        let key = spec.key().clone();
        Arc::new(Self {
            source: ItemSource::from_spec(kind, spec.source),
            key,
            slot,
            first,
            sync,
            cancelled: CancellationToken::new(),
            inner: Mutex::new(ItemInner {
                state: ItemState::Initializing,
                ready: false,
                init_started: false,
                resource: None,
                result: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ItemInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn kind(&self) -> ResourceKind {
        self.key.kind()
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn state(&self) -> ItemState {
        self.lock().state
    }

    /// Init finished and the item was not cancelled.
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Stop an in-flight init. The item will never attach afterwards.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// Resolve synchronous kinds without suspending. Returns false for
    /// kinds that need `init`.
    pub fn init_now(&self) -> bool {
        if !self.kind().is_sync() {
            return false;
        }
        if !self.is_cancelled() {
            let mut inner = self.lock();
            if inner.state != ItemState::Destroyed {
                inner.ready = true;
            }
        }
        true
    }

    /// Establish the data this item publishes. A cancelled init resolves
    /// without error and leaves nothing acquired. Only the first call does
    /// any work; a failed init may be retried.
    pub async fn init(&self) -> Result<()> {
        if self.init_now() {
            return Ok(());
        }
        {
            let mut inner = self.lock();
            if inner.init_started {
                tracing::debug!("init of {} already started", self.key);
                return Ok(());
            }
            inner.init_started = true;
        }

        let result = match &self.source {
            ItemSource::Remote(target) => self.init_remote(target.clone()).await,
            ItemSource::AsyncCall(spec) => self.init_async_call(spec).await,
            ItemSource::Local { .. } | ItemSource::Value { .. } => Ok(()),
        };
        if result.is_err() {
            self.lock().init_started = false;
        }
        result
    }

    async fn init_remote(&self, target: RemoteTarget) -> Result<()> {
        let registry = self.sync.registry();
        let client = self.sync.client();
        let tree = self.sync.tree().clone();
        let config = self.sync.config();
        let factory =
            move |key: ResourceKey| LiveResource::open(client, key, target, tree, config);

        // dropping the acquire gives its reference back
        let resource = tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => {
                tracing::debug!("init of {} cancelled while acquiring", self.key);
                return Ok(());
            }
            acquired = registry.acquire(self.key.clone(), factory) => acquired?,
        };

        let mut inner = self.lock();
        if inner.state == ItemState::Destroyed || self.is_cancelled() {
            drop(inner);
            tracing::debug!("{} acquired after cancel, releasing", self.key);
            registry.release(&self.key, self.sync.config().teardown_delay);
            return Ok(());
        }
        inner.resource = Some(resource);
        inner.ready = true;
        Ok(())
    }

    async fn init_async_call(&self, spec: &AsyncCallSpec) -> Result<()> {
        if let (false, Some(delay)) = (self.first, spec.debounce) {
            tokio::select! {
                biased;
                _ = self.cancelled.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.is_cancelled() {
            return Ok(());
        }

        tracing::debug!("calling {}", spec.name);
        let value = tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => return Ok(()),
            result = (spec.call)(spec.inputs.clone()) => result.map_err(|err| match err {
                SyncError::AsyncCall(_) => err,
                other => SyncError::AsyncCall(format!("{}: {}", spec.name, other)),
            })?,
        };

        let mut inner = self.lock();
        if inner.state == ItemState::Destroyed || self.is_cancelled() {
            return Ok(());
        }
        inner.result = Some(value);
        inner.ready = true;
        Ok(())
    }

    /// Publish this item's data at its slot, inside one batch. No-op unless
    /// init finished and the item is not attached, cancelled or destroyed.
    pub fn ref_model(&self) -> Result<()> {
        let (resource, result) = {
            let inner = self.lock();
            let attachable = matches!(inner.state, ItemState::Initializing | ItemState::Detached);
            if !inner.ready || !attachable || self.is_cancelled() {
                tracing::debug!(
                    "not attaching {} (state={:?}, ready={})",
                    self.key,
                    inner.state,
                    inner.ready
                );
                return Ok(());
            }
            (inner.resource.clone(), inner.result.clone())
        };

        let tree = self.sync.tree();
        self.sync.batch(|| -> Result<()> {
            match &self.source {
                ItemSource::Remote(_) => {
                    let Some(resource) = resource else {
                        return Err(SyncError::subscription(&self.key, "no live resource"));
                    };
                    tree.link(&self.slot, resource.path())?;
                    if let Some(ids) = resource.ids_path() {
                        tree.link(&ids_slot_name(&self.slot), ids)?;
                    }
                }
                ItemSource::Local { path } => tree.link(&self.slot, path)?,
                ItemSource::Value { value } => {
                    tree.unlink(&self.slot);
                    tree.set(&self.slot, value.clone());
                }
                ItemSource::AsyncCall(spec) => {
                    let value = result.unwrap_or(Value::Null);
                    match &spec.path {
                        Some(path) => {
                            tree.set(path, value);
                            tree.link(&self.slot, path)?;
                        }
                        None => {
                            tree.unlink(&self.slot);
                            tree.set(&self.slot, value);
                        }
                    }
                }
            }
            Ok(())
        })?;

        let mut inner = self.lock();
        if inner.state != ItemState::Destroyed {
            inner.state = ItemState::Attached;
        }
        tracing::debug!("attached {} at {}", self.key, self.slot);
        Ok(())
    }

    /// Remove this item's data from its slot. No-op unless attached.
    pub fn unref_model(&self) {
        let resource = {
            let mut inner = self.lock();
            if inner.state != ItemState::Attached {
                return;
            }
            inner.state = ItemState::Detached;
            inner.resource.clone()
        };
        self.detach(resource.as_deref());
    }

    fn detach(&self, resource: Option<&LiveResource>) {
        let tree = self.sync.tree();
        self.sync.batch(|| match &self.source {
            ItemSource::Remote(_) => {
                if let Some(resource) = resource {
                    clear_link(tree, &self.slot, resource.path());
                    if let Some(ids) = resource.ids_path() {
                        clear_link(tree, &ids_slot_name(&self.slot), ids);
                    }
                }
            }
            ItemSource::Local { path } => clear_link(tree, &self.slot, path),
            ItemSource::Value { .. } => tree.clear(&self.slot),
            ItemSource::AsyncCall(spec) => match &spec.path {
                Some(path) => {
                    clear_link(tree, &self.slot, path);
                    tree.delete(path);
                }
                None => tree.clear(&self.slot),
            },
        });
        tracing::debug!("detached {} from {}", self.key, self.slot);
    }

    /// Cancel, detach and give back the reference. Safe to call repeatedly.
    pub fn destroy(&self) {
        let (previous, resource) = {
            let mut inner = self.lock();
            if inner.state == ItemState::Destroyed {
                return;
            }
            let previous = inner.state;
            inner.state = ItemState::Destroyed;
            inner.ready = false;
            (previous, inner.resource.take())
        };

        self.cancelled.cancel();
        if previous == ItemState::Attached {
            self.detach(resource.as_deref());
        }
        if resource.is_some() {
            self.sync
                .registry()
                .release(&self.key, self.sync.config().teardown_delay);
        }
        tracing::debug!("destroyed item {} ({:?})", self.key, previous);
    }
}

/// Remove `slot` only while it still points at `target`; another item may
/// own the slot by now.
fn clear_link(tree: &DataTree, slot: &str, target: &str) {
    if tree.link_target(slot).as_deref() == Some(target) {
        tree.clear(slot);
    }
}
