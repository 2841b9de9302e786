//! The consumer-visible data tree.
//!
//! Values live at flat string paths. A path may instead be a link to
//! another path, which is how a consumer slot publishes shared data without
//! copying it: every consumer of one query links its slot to the query's
//! canonical path, so one splice there is observed by all of them.
//!
//! Reads made through an [`Observer`] are recorded per path. Any write to a
//! recorded path registers the observer's notifier with the
//! [`BatchScheduler`] inside the write's batch, so consumers are told about
//! changes only for paths they actually read, at most once per batch.

use crate::batch::{BatchScheduler, Notifier};
use crate::config::DEFAULT_MAX_LINK_DEPTH;
use crate::error::{Result, SyncError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct ObserverRecord {
    notifier: Notifier,
    paths: HashSet<String>,
}

#[derive(Default)]
struct TreeState {
    values: HashMap<String, Value>,
    links: HashMap<String, String>,
    /// path -> observers that read it
    deps: HashMap<String, HashSet<u64>>,
    observers: HashMap<u64, ObserverRecord>,
}

impl TreeState {
    /// The chain of paths visited while resolving `path`, ending at the
    /// path that holds the value.
    fn resolve_chain(&self, path: &str, max_depth: usize) -> Vec<String> {
        let mut chain = vec![path.to_string()];
        let mut current = path;
        for _ in 0..max_depth {
            match self.links.get(current) {
                Some(target) => {
                    chain.push(target.clone());
                    current = target;
                }
                None => return chain,
            }
        }
        tracing::warn!("link depth exceeded while resolving {}", path);
        chain
    }

    fn resolve(&self, path: &str, max_depth: usize) -> String {
        self.resolve_chain(path, max_depth)
            .pop()
            .unwrap_or_else(|| path.to_string())
    }

    fn notifiers_for(&self, path: &str) -> Vec<Notifier> {
        self.deps
            .get(path)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.observers.get(id))
                    .map(|record| record.notifier.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn forget_paths(&mut self, observer: u64) {
        if let Some(record) = self.observers.get_mut(&observer) {
            for path in record.paths.drain() {
                if let Some(ids) = self.deps.get_mut(&path) {
                    ids.remove(&observer);
                    if ids.is_empty() {
                        self.deps.remove(&path);
                    }
                }
            }
        }
    }
}

struct TreeInner {
    state: Mutex<TreeState>,
    scheduler: BatchScheduler,
    max_link_depth: usize,
    next_observer: AtomicU64,
}

impl TreeInner {
    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct DataTree {
    inner: Arc<TreeInner>,
}

impl DataTree {
    pub fn new(scheduler: BatchScheduler) -> Self {
        Self::with_max_link_depth(scheduler, DEFAULT_MAX_LINK_DEPTH)
    }

    pub fn with_max_link_depth(scheduler: BatchScheduler, max_link_depth: usize) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                state: Mutex::new(TreeState::default()),
                scheduler,
                max_link_depth: max_link_depth.max(1),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.inner.scheduler
    }

    /// Apply `mutate` under the tree lock and notify observers of the paths
    /// it reports as changed, all inside one batch.
    fn write<R>(&self, mutate: impl FnOnce(&mut TreeState) -> (R, Vec<String>)) -> R {
        let scheduler = &self.inner.scheduler;
        scheduler.batch(|| {
            let (result, notifiers) = {
                let mut state = self.inner.lock();
                let (result, changed) = mutate(&mut state);
                let mut notifiers = Vec::new();
                for path in &changed {
                    notifiers.extend(state.notifiers_for(path));
                }
                (result, notifiers)
            };
            for notifier in notifiers {
                scheduler.add(notifier);
            }
            result
        })
    }

    /// Read without recording a dependency.
    pub fn get(&self, path: &str) -> Option<Value> {
        let state = self.inner.lock();
        let resolved = state.resolve(path, self.inner.max_link_depth);
        state.values.get(&resolved).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Write through links to the resolved path.
    pub fn set(&self, path: &str, value: Value) {
        let max_depth = self.inner.max_link_depth;
        self.write(|state| {
            let resolved = state.resolve(path, max_depth);
            state.values.insert(resolved.clone(), value);
            ((), vec![resolved])
        })
    }

    pub fn delete(&self, path: &str) -> Option<Value> {
        let max_depth = self.inner.max_link_depth;
        self.write(|state| {
            let resolved = state.resolve(path, max_depth);
            let removed = state.values.remove(&resolved);
            let changed = if removed.is_some() { vec![resolved] } else { Vec::new() };
            (removed, changed)
        })
    }

    /// Remove `remove` items at `index` and insert `items` there, on the
    /// array at `path`. A missing value is treated as an empty array.
    /// Returns the removed items.
    pub fn splice(
        &self,
        path: &str,
        index: usize,
        remove: usize,
        items: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let max_depth = self.inner.max_link_depth;
        self.write(|state| {
            let resolved = state.resolve(path, max_depth);
            let array = state
                .values
                .entry(resolved.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(array) = array else {
                return (
                    Err(SyncError::InvalidParams(format!(
                        "cannot splice {}: value is not an array",
                        resolved
                    ))),
                    Vec::new(),
                );
            };

            let start = if index > array.len() {
                tracing::warn!(
                    "splice index {} past end of {} (len {})",
                    index,
                    resolved,
                    array.len()
                );
                array.len()
            } else {
                index
            };
            let end = start + remove.min(array.len() - start);
            let removed: Vec<Value> = array.splice(start..end, items).collect();
            (Ok(removed), vec![resolved])
        })
    }

    /// Make `slot` resolve to `target`. Refuses links that would form a cycle.
    pub fn link(&self, slot: &str, target: &str) -> Result<()> {
        let max_depth = self.inner.max_link_depth;
        self.write(|state| {
            if state.resolve_chain(target, max_depth).iter().any(|p| p == slot) {
                return (
                    Err(SyncError::InvalidParams(format!(
                        "linking {} to {} would form a cycle",
                        slot, target
                    ))),
                    Vec::new(),
                );
            }
            state.links.insert(slot.to_string(), target.to_string());
            (Ok(()), vec![slot.to_string()])
        })
    }

    pub fn unlink(&self, slot: &str) -> bool {
        self.write(|state| {
            let removed = state.links.remove(slot).is_some();
            let changed = if removed { vec![slot.to_string()] } else { Vec::new() };
            (removed, changed)
        })
    }

    pub fn link_target(&self, slot: &str) -> Option<String> {
        self.inner.lock().links.get(slot).cloned()
    }

    /// Remove both the link and the value stored at exactly `path`.
    pub fn clear(&self, path: &str) {
        self.write(|state| {
            let had_link = state.links.remove(path).is_some();
            let had_value = state.values.remove(path).is_some();
            let changed = if had_link || had_value {
                vec![path.to_string()]
            } else {
                Vec::new()
            };
            ((), changed)
        })
    }

    /// Create an observer whose notifier fires when a path it read changes.
    pub fn observer(&self, notifier: Notifier) -> Observer {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().observers.insert(
            id,
            ObserverRecord {
                notifier,
                paths: HashSet::new(),
            },
        );
        Observer {
            id,
            tree: Arc::downgrade(&self.inner),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }
}

/// Dependency-tracking read handle. Dropping it stops notifications.
pub struct Observer {
    id: u64,
    tree: Weak<TreeInner>,
}

impl Observer {
    /// Read `path`, recording it (and every link on the way) as a dependency.
    pub fn read(&self, path: &str) -> Option<Value> {
        let tree = self.tree.upgrade()?;
        let mut state = tree.lock();
        let chain = state.resolve_chain(path, tree.max_link_depth);
        let value = chain.last().and_then(|p| state.values.get(p)).cloned();

        for p in &chain {
            state.deps.entry(p.clone()).or_default().insert(self.id);
        }
        if let Some(record) = state.observers.get_mut(&self.id) {
            record.paths.extend(chain);
        }
        value
    }

    /// Replace the recorded dependencies with the reads made by `f`.
    pub fn track<R>(&self, f: impl FnOnce(&Observer) -> R) -> R {
        self.clear();
        f(self)
    }

    pub fn clear(&self) {
        if let Some(tree) = self.tree.upgrade() {
            tree.lock().forget_paths(self.id);
        }
    }

    pub fn dependencies(&self) -> Vec<String> {
        let Some(tree) = self.tree.upgrade() else {
            return Vec::new();
        };
        let state = tree.lock();
        let mut paths: Vec<String> = state
            .observers
            .get(&self.id)
            .map(|record| record.paths.iter().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(tree) = self.tree.upgrade() {
            let mut state = tree.lock();
            state.forget_paths(self.id);
            state.observers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Notifier, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_ref = hits.clone();
        let notifier = Notifier::new(move || {
            hits_ref.fetch_add(1, Ordering::SeqCst);
        });
        (notifier, hits)
    }

    #[test]
    fn test_set_and_get_follow_links() {
        let tree = DataTree::new(BatchScheduler::new());
        tree.set("doc:users:u1", json!({"name": "Ada"}));
        tree.link("$bindings.1", "doc:users:u1").unwrap();

        assert_eq!(tree.get("$bindings.1").unwrap()["name"], "Ada");

        tree.set("$bindings.1", json!({"name": "Grace"}));
        assert_eq!(tree.get("doc:users:u1").unwrap()["name"], "Grace");
    }

    #[test]
    fn test_observer_notified_once_per_batch() {
        let tree = DataTree::new(BatchScheduler::new());
        let (notifier, hits) = counting();
        let observer = tree.observer(notifier);

        tree.set("list", json!([]));
        observer.track(|o| o.read("list"));

        tree.scheduler().batch(|| {
            tree.splice("list", 0, 0, vec![json!(1)]).unwrap();
            tree.splice("list", 1, 0, vec![json!(2)]).unwrap();
            tree.set("unrelated", json!(true));
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tree.get("list").unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_untracked_paths_do_not_notify() {
        let tree = DataTree::new(BatchScheduler::new());
        let (notifier, hits) = counting();
        let observer = tree.observer(notifier);
        observer.track(|o| o.read("a"));

        tree.set("b", json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tree.set("a", json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reading_through_link_tracks_target_and_slot() {
        let tree = DataTree::new(BatchScheduler::new());
        let (notifier, hits) = counting();
        let observer = tree.observer(notifier);

        tree.set("target", json!("v1"));
        tree.link("slot", "target").unwrap();
        assert_eq!(observer.read("slot"), Some(json!("v1")));
        assert_eq!(observer.dependencies(), vec!["slot", "target"]);

        tree.set("target", json!("v2"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tree.unlink("slot");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(tree.get("slot"), None);
    }

    #[test]
    fn test_track_replaces_dependencies() {
        let tree = DataTree::new(BatchScheduler::new());
        let (notifier, hits) = counting();
        let observer = tree.observer(notifier);

        observer.track(|o| o.read("a"));
        observer.track(|o| o.read("b"));

        tree.set("a", json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tree.set("b", json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_observer_stops_notifications() {
        let tree = DataTree::new(BatchScheduler::new());
        let (notifier, hits) = counting();
        let observer = tree.observer(notifier);
        observer.read("a");
        drop(observer);

        tree.set("a", json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(tree.observer_count(), 0);
    }

    #[test]
    fn test_splice_semantics() {
        let tree = DataTree::new(BatchScheduler::new());
        tree.set("list", json!(["a", "b", "c", "d"]));

        let removed = tree.splice("list", 1, 2, vec![json!("x")]).unwrap();
        assert_eq!(removed, vec![json!("b"), json!("c")]);
        assert_eq!(tree.get("list").unwrap(), json!(["a", "x", "d"]));

        tree.splice("list", 99, 5, vec![json!("z")]).unwrap();
        assert_eq!(tree.get("list").unwrap(), json!(["a", "x", "d", "z"]));

        tree.splice("fresh", 0, 0, vec![json!(1)]).unwrap();
        assert_eq!(tree.get("fresh").unwrap(), json!([1]));

        tree.set("scalar", json!(5));
        assert!(tree.splice("scalar", 0, 0, vec![]).is_err());
    }

    #[test]
    fn test_link_cycles_are_refused() {
        let tree = DataTree::new(BatchScheduler::new());
        tree.link("a", "b").unwrap();
        tree.link("b", "c").unwrap();
        assert!(tree.link("c", "a").is_err());
        assert!(tree.link("a", "a").is_err());
    }

    #[test]
    fn test_clear_removes_link_and_value() {
        let tree = DataTree::new(BatchScheduler::new());
        tree.set("target", json!(1));
        tree.link("slot", "target").unwrap();
        tree.clear("slot");

        assert_eq!(tree.link_target("slot"), None);
        assert_eq!(tree.get("target"), Some(json!(1)));
        assert_eq!(tree.delete("target"), Some(json!(1)));
        assert!(!tree.contains("target"));
    }
}
