//! Batched change notification.
//!
//! Mutations made inside [`BatchScheduler::batch`] register [`Notifier`]s
//! instead of calling consumers directly. Notifiers are deduplicated by
//! identity and invoked once, in first-registered order, when the outermost
//! batch exits. A notifier added outside any batch opens a micro-batch that
//! is flushed on a later scheduling turn, so several synchronous adds in
//! one turn still collapse into one notification.
//!
//! The turn boundary is exact only on a current-thread runtime. On a
//! multi-thread runtime the flush task may run on another worker while the
//! adding task is still going; the flush yields once before draining, but
//! only an explicit `batch` guarantees one notification there. Every write
//! made through the data tree is already wrapped in one.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_NOTIFIER_ID: AtomicU64 = AtomicU64::new(1);

/// A change callback with a stable identity. Clones share the identity.
#[derive(Clone)]
pub struct Notifier {
    id: u64,
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl Notifier {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            id: NEXT_NOTIFIER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn notify(&self) {
        (self.callback)()
    }
}

impl PartialEq for Notifier {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Notifier {}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    pending: Vec<Notifier>,
    seen: HashSet<u64>,
    micro_scheduled: bool,
}

impl BatchState {
    fn take_pending(&mut self) -> Vec<Notifier> {
        self.seen.clear();
        std::mem::take(&mut self.pending)
    }
}

#[derive(Clone, Default)]
pub struct BatchScheduler {
    state: Arc<Mutex<BatchState>>,
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` inside a batch. Only the outermost batch flushes. A panic in
    /// `f` still closes the batch and fires what was registered before the
    /// panic resumes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock().depth += 1;
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        self.exit();
        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn exit(&self) {
        let ready = {
            let mut state = self.lock();
            if state.depth == 0 {
                tracing::error!("batch exit without a matching enter");
                return;
            }
            state.depth -= 1;
            if state.depth > 0 {
                return;
            }
            state.take_pending()
        };
        run_notifiers(ready);
    }

    /// Register `notifier` for the current batch.
    pub fn add(&self, notifier: Notifier) {
        let mut state = self.lock();
        if state.seen.insert(notifier.id) {
            state.pending.push(notifier);
        }
        if state.depth > 0 || state.micro_scheduled {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.micro_scheduled = true;
                drop(state);
                let scheduler = self.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    scheduler.flush_micro_batch();
                });
            }
            Err(_) => {
                let ready = state.take_pending();
                drop(state);
                run_notifiers(ready);
            }
        }
    }

    fn flush_micro_batch(&self) {
        let ready = {
            let mut state = self.lock();
            state.micro_scheduled = false;
            // an open batch picks these up on exit
            if state.depth > 0 {
                return;
            }
            state.take_pending()
        };
        run_notifiers(ready);
    }

    /// Drop every notifier registered so far in the current batch. Returns
    /// how many were dropped.
    pub fn discard_pending(&self) -> usize {
        self.lock().take_pending().len()
    }

    pub fn depth(&self) -> usize {
        self.lock().depth
    }

    pub fn is_batching(&self) -> bool {
        self.depth() > 0
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}

fn run_notifiers(notifiers: Vec<Notifier>) {
    if notifiers.is_empty() {
        return;
    }
    tracing::trace!("flushing {} notifiers", notifiers.len());
    for notifier in notifiers {
        if panic::catch_unwind(AssertUnwindSafe(|| notifier.notify())).is_err() {
            tracing::error!("notifier {} panicked during flush", notifier.id);
        }
    }
}
