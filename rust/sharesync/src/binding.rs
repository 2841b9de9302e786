//! One consumer slot and the resource it currently declares.
//!
//! Each `declare` with a new key creates a fresh [`SubscriptionItem`] and
//! supersedes whatever was in flight. Only the latest declaration may
//! attach; when it does, every older item is destroyed in the same batch
//! so consumers never observe the slot empty in between.

use crate::client::ShareSync;
use crate::item::SubscriptionItem;
use crate::key::{ids_slot_name, ResourceKey, ResourceSpec};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

#[derive(Default)]
struct BindingState {
    generation: u64,
    current: Option<Arc<SubscriptionItem>>,
    /// Every item not yet destroyed, oldest first.
    items: Vec<Arc<SubscriptionItem>>,
    inits: u64,
    unmounted: bool,
}

struct BindingInner {
    sync: ShareSync,
    slot: String,
    state: Mutex<BindingState>,
}

impl BindingInner {
    fn lock(&self) -> MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, generation: u64, item: &Arc<SubscriptionItem>) {
        self.sync.batch(|| {
            let superseded = {
                let mut state = self.lock();
                if state.unmounted || state.generation != generation || item.is_cancelled() {
                    tracing::debug!("dropping stale init of {} for {}", item.key(), self.slot);
                    return;
                }
                let (keep, superseded): (Vec<_>, Vec<_>) = state
                    .items
                    .drain(..)
                    .partition(|other| Arc::ptr_eq(other, item));
                state.items = keep;
                state.inits += 1;
                superseded
            };

            for other in superseded {
                other.destroy();
            }
            if let Err(err) = item.ref_model() {
                tracing::warn!("failed to attach {} at {}: {}", item.key(), self.slot, err);
            }
        });
    }

    fn unmount(&self) {
        let items = {
            let mut state = self.lock();
            if state.unmounted {
                return;
            }
            state.unmounted = true;
            state.current = None;
            std::mem::take(&mut state.items)
        };

        let tree = self.sync.tree();
        self.sync.batch(|| {
            for item in &items {
                item.destroy();
            }
            tree.clear(&self.slot);
            tree.clear(&ids_slot_name(&self.slot));
        });
        tracing::debug!("unmounted {} ({} items)", self.slot, items.len());
    }
}

/// Dropping a binding unmounts it.
pub struct Binding {
    inner: Arc<BindingInner>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("slot", &self.inner.slot)
            .field("key", &self.key())
            .finish_non_exhaustive()
    }
}

impl Binding {
    pub(crate) fn new(sync: ShareSync, slot: String) -> Self {
        Self {
            inner: Arc::new(BindingInner {
                sync,
                slot,
                state: Mutex::new(BindingState::default()),
            }),
        }
    }

    pub fn slot(&self) -> &str {
        &self.inner.slot
    }

    /// The sibling slot holding a query's ordered ids.
    pub fn ids_slot(&self) -> String {
        ids_slot_name(&self.inner.slot)
    }

    /// Key of the most recent declaration.
    pub fn key(&self) -> Option<ResourceKey> {
        self.inner
            .lock()
            .current
            .as_ref()
            .map(|item| item.key().clone())
    }

    /// Declare the resource this slot should show. Redeclaring the current
    /// key does nothing. Returns the init task for kinds that need one;
    /// outside a tokio runtime those kinds are refused and `None` returned.
    pub fn declare(&self, spec: ResourceSpec) -> Option<JoinHandle<()>> {
        let (generation, item) = {
            let mut state = self.inner.lock();
            if state.unmounted {
                tracing::warn!("declare on unmounted binding {}", self.inner.slot);
                return None;
            }
            if state
                .current
                .as_ref()
                .is_some_and(|item| item.key() == spec.key())
            {
                return None;
            }

            state.generation += 1;
            let first = state.inits == 0 && state.current.is_none();
            let item = SubscriptionItem::new(
                self.inner.sync.clone(),
                spec,
                self.inner.slot.clone(),
                first,
            );
            if let Some(previous) = state.current.replace(item.clone()) {
                previous.cancel();
            }
            state.items.push(item.clone());
            (state.generation, item)
        };
        tracing::debug!("{} declares {}", self.inner.slot, item.key());

        if item.init_now() {
            self.inner.finish(generation, &item);
            return None;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!("cannot init {} for {}: {}", item.key(), self.inner.slot, err);
                {
                    let mut state = self.inner.lock();
                    state.items.retain(|other| !Arc::ptr_eq(other, &item));
                    if state.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &item)) {
                        state.current = None;
                    }
                }
                item.destroy();
                return None;
            }
        };

        let inner = self.inner.clone();
        Some(handle.spawn(async move {
            match item.init().await {
                Ok(()) => inner.finish(generation, &item),
                Err(err) => {
                    tracing::warn!("init of {} for {} failed: {}", item.key(), inner.slot, err);
                }
            }
        }))
    }

    /// The published value. `None` until the first declaration attaches.
    pub fn data(&self) -> Option<Value> {
        if self.ready_count() == 0 {
            return None;
        }
        self.inner.sync.tree().get(&self.inner.slot)
    }

    /// Ordered ids of the published query, if the slot holds one.
    pub fn ids(&self) -> Option<Value> {
        if self.ready_count() == 0 {
            return None;
        }
        self.inner.sync.tree().get(&self.ids_slot())
    }

    /// How many declarations have attached so far.
    pub fn ready_count(&self) -> u64 {
        self.inner.lock().inits
    }

    pub fn is_ready(&self) -> bool {
        self.ready_count() > 0
    }

    /// Number of items not yet destroyed, including in-flight ones.
    pub fn live_items(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_unmounted(&self) -> bool {
        self.inner.lock().unmounted
    }

    /// Cancel and destroy every item and clear the slot.
    pub fn unmount(&self) {
        self.inner.unmount();
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.inner.unmount();
    }
}
