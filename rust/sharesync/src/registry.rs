//! Reference-counted cache of live subscriptions.
//!
//! The registry owns at most one underlying resource per [`ResourceKey`].
//! Every `acquire` bumps the key's count; every `release` drops it. When the
//! count reaches zero a grace timer starts, and only if the count is still
//! zero when it fires is the resource torn down. A re-acquire inside the
//! window cancels the timer and reuses the live resource.
//!
//! Creation runs in its own task and publishes its outcome through a
//! `watch` channel, so every acquirer of a key that is still pending waits
//! on the same creation, and an acquirer that goes away mid-wait does not
//! strand the others.

use crate::config::DEFAULT_TEARDOWN_DELAY;
use crate::counter::RefCounter;
use crate::error::{Result, SyncError};
use crate::key::ResourceKey;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// The registry-owned side of a shared resource.
pub trait Teardown: Send + Sync + 'static {
    /// Release the underlying subscription. Best effort: errors are logged
    /// and the entry is dropped regardless.
    fn teardown(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Ready,
    Errored,
}

enum ReadyState<R> {
    Pending,
    Ready(Arc<R>),
    Errored(SyncError),
}

impl<R> ReadyState<R> {
    fn kind(&self) -> EntryState {
        match self {
            ReadyState::Pending => EntryState::Pending,
            ReadyState::Ready(_) => EntryState::Ready,
            ReadyState::Errored(_) => EntryState::Errored,
        }
    }
}

impl<R> Clone for ReadyState<R> {
    fn clone(&self) -> Self {
        match self {
            ReadyState::Pending => ReadyState::Pending,
            ReadyState::Ready(resource) => ReadyState::Ready(resource.clone()),
            ReadyState::Errored(err) => ReadyState::Errored(err.clone()),
        }
    }
}

struct RegistryEntry<R> {
    state: watch::Sender<ReadyState<R>>,
}

struct Slot<R> {
    entry: Arc<RegistryEntry<R>>,
    generation: u64,
    teardown: Option<AbortHandle>,
}

struct RegistryState<R> {
    entries: HashMap<ResourceKey, Slot<R>>,
    counter: RefCounter<ResourceKey>,
    next_generation: u64,
}

struct RegistryInner<R> {
    state: Mutex<RegistryState<R>>,
    default_delay: Duration,
}

pub struct SubscriptionRegistry<R> {
    inner: Arc<RegistryInner<R>>,
}

impl<R> Clone for SubscriptionRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Teardown> Default for SubscriptionRegistry<R> {
    fn default() -> Self {
        Self::new(DEFAULT_TEARDOWN_DELAY)
    }
}

impl<R> fmt::Debug for SubscriptionRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("default_delay", &self.inner.default_delay)
            .finish_non_exhaustive()
    }
}

impl<R: Teardown> SubscriptionRegistry<R> {
    /// `default_delay` is the grace window used when an acquire is abandoned
    /// mid-wait and has to give its reference back on its own.
    pub fn new(default_delay: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    entries: HashMap::new(),
                    counter: RefCounter::new(),
                    next_generation: 0,
                }),
                default_delay,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<R>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a reference on `key`, creating the underlying resource with
    /// `factory` if no entry exists. Concurrent acquirers of a pending key
    /// all wait for the one in-flight creation.
    ///
    /// On success the caller owns one reference and must `release` it. On
    /// failure the reference is already given back.
    pub async fn acquire<F, Fut>(&self, key: ResourceKey, factory: F) -> Result<Arc<R>>
    where
        F: FnOnce(ResourceKey) -> Fut,
        Fut: Future<Output = Result<Arc<R>>> + Send + 'static,
    {
        let mut guard = AcquireGuard {
            registry: self.clone(),
            key: key.clone(),
            armed: true,
        };

        let (entry, created) = {
            let mut state = self.lock();
            let count = state.counter.increment(&key);
            if let Some(slot) = state.entries.get_mut(&key) {
                if let Some(timer) = slot.teardown.take() {
                    timer.abort();
                    tracing::debug!("reusing {} inside its teardown window", key);
                }
                tracing::debug!("acquire {} (refs={}, shared)", key, count);
                (slot.entry.clone(), None)
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                let (tx, _) = watch::channel(ReadyState::Pending);
                let entry = Arc::new(RegistryEntry { state: tx });
                state.entries.insert(
                    key.clone(),
                    Slot {
                        entry: entry.clone(),
                        generation,
                        teardown: None,
                    },
                );
                tracing::debug!("acquire {} (refs={}, creating)", key, count);
                (entry, Some(generation))
            }
        };

        if let Some(generation) = created {
            let creation = factory(key.clone());
            let registry = self.clone();
            let created_key = key.clone();
            tokio::spawn(async move {
                let result = creation.await;
                registry.complete(&created_key, generation, result);
            });
        }

        let mut rx = entry.state.subscribe();
        let outcome = rx
            .wait_for(|state| !matches!(state, ReadyState::Pending))
            .await
            .map(|state| state.clone());

        match outcome {
            Ok(ReadyState::Ready(resource)) => {
                guard.armed = false;
                Ok(resource)
            }
            Ok(ReadyState::Errored(err)) => {
                guard.armed = false;
                self.rollback(&key);
                Err(err)
            }
            Ok(ReadyState::Pending) | Err(_) => {
                guard.armed = false;
                self.rollback(&key);
                Err(SyncError::subscription(&key, "registry entry dropped"))
            }
        }
    }

    /// Give back a reference whose acquire failed. The failed entry is
    /// already gone, but a newer entry for the same key may have been
    /// created since, so the release path decides whether to start its
    /// teardown timer. After a shutdown there is nothing to give back.
    fn rollback(&self, key: &ResourceKey) {
        if self.ref_count(key) == 0 {
            tracing::trace!("nothing to roll back for {}", key);
            return;
        }
        tracing::trace!("rolling back failed acquire of {}", key);
        self.release(key, self.inner.default_delay);
    }

    fn complete(&self, key: &ResourceKey, generation: u64, result: Result<Arc<R>>) {
        let mut state = self.lock();
        let current = state
            .entries
            .get(key)
            .filter(|slot| slot.generation == generation)
            .is_some();

        match result {
            Ok(resource) if current => {
                if let Some(slot) = state.entries.get(key) {
                    slot.entry.state.send_replace(ReadyState::Ready(resource));
                }
                tracing::debug!("subscription {} ready", key);
            }
            Ok(resource) => {
                drop(state);
                tracing::debug!("subscription {} finished after its entry was dropped", key);
                if let Err(err) = resource.teardown() {
                    tracing::warn!("teardown of orphaned {} failed: {}", key, err);
                }
            }
            Err(err) => {
                tracing::warn!("subscription {} failed: {}", key, err);
                if current {
                    if let Some(slot) = state.entries.remove(key) {
                        if let Some(timer) = slot.teardown {
                            timer.abort();
                        }
                        slot.entry.state.send_replace(ReadyState::Errored(err));
                    }
                }
            }
        }
    }

    /// Drop a reference on `key`. When the count reaches zero the resource
    /// is torn down after `delay`, unless it is acquired again first.
    pub fn release(&self, key: &ResourceKey, delay: Duration) {
        let mut state = self.lock();
        let count = state.counter.decrement(key);
        if count > 0 {
            tracing::debug!("release {} (refs={})", key, count);
            return;
        }

        let Some(slot) = state.entries.get_mut(key) else {
            return;
        };
        if let Some(timer) = slot.teardown.take() {
            timer.abort();
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !delay.is_zero() => handle,
            _ => {
                let slot = state.entries.remove(key);
                drop(state);
                if let Some(slot) = slot {
                    tracing::debug!("tearing down {} immediately", key);
                    teardown_entry(key, &slot.entry);
                }
                return;
            }
        };

        tracing::debug!("release {} (refs=0), teardown in {:?}", key, delay);
        let generation = slot.generation;
        let registry = self.clone();
        let expired_key = key.clone();
        let timer = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            registry.expire(&expired_key, generation);
        });
        slot.teardown = Some(timer.abort_handle());
    }

    fn expire(&self, key: &ResourceKey, generation: u64) {
        let slot = {
            let mut state = self.lock();
            let count = state.counter.count(key);
            if count > 0 {
                tracing::debug!("skipping teardown of {}: re-acquired (refs={})", key, count);
                if let Some(slot) = state.entries.get_mut(key) {
                    slot.teardown = None;
                }
                return;
            }
            let current = state.entries.get(key).map(|slot| slot.generation);
            if current != Some(generation) {
                return;
            }
            state.entries.remove(key)
        };

        if let Some(slot) = slot {
            teardown_entry(key, &slot.entry);
        }
    }

    /// Tear down every entry now, regardless of counts. Acquires still
    /// waiting on a pending entry fail.
    pub fn shutdown(&self) {
        let entries: Vec<(ResourceKey, Slot<R>)> = {
            let mut state = self.lock();
            state.counter = RefCounter::new();
            state.entries.drain().collect()
        };
        tracing::debug!("shutting down registry with {} entries", entries.len());
        for (key, slot) in entries {
            if let Some(timer) = slot.teardown {
                timer.abort();
            }
            teardown_entry(&key, &slot.entry);
        }
    }

    pub fn ref_count(&self, key: &ResourceKey) -> u64 {
        self.lock().counter.count(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn state(&self, key: &ResourceKey) -> Option<EntryState> {
        self.lock()
            .entries
            .get(key)
            .map(|slot| slot.entry.state.borrow().kind())
    }

    pub fn is_ready(&self, key: &ResourceKey) -> bool {
        self.state(key) == Some(EntryState::Ready)
    }

    /// The live resource for `key`, if it is ready. Takes no reference.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<R>> {
        let state = self.lock();
        let slot = state.entries.get(key)?;
        let ready = slot.entry.state.borrow();
        match &*ready {
            ReadyState::Ready(resource) => Some(resource.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn default_delay(&self) -> Duration {
        self.inner.default_delay
    }
}

fn teardown_entry<R: Teardown>(key: &ResourceKey, entry: &RegistryEntry<R>) {
    let ready = entry.state.borrow().clone();
    match ready {
        ReadyState::Ready(resource) => {
            if let Err(err) = resource.teardown() {
                tracing::warn!("teardown of {} failed: {}", key, err);
            } else {
                tracing::debug!("tore down {}", key);
            }
        }
        ReadyState::Pending => {
            tracing::debug!("dropped pending {}; creation will be discarded", key);
            entry.state.send_replace(ReadyState::Errored(SyncError::subscription(
                key,
                "dropped before it was ready",
            )));
        }
        ReadyState::Errored(_) => {}
    }
}

/// Gives the reference back if an acquire is dropped before it resolves.
struct AcquireGuard<R: Teardown> {
    registry: SubscriptionRegistry<R>,
    key: ResourceKey,
    armed: bool,
}

impl<R: Teardown> Drop for AcquireGuard<R> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("acquire of {} abandoned before it resolved", self.key);
            let delay = self.registry.default_delay();
            self.registry.release(&self.key, delay);
        }
    }
}
