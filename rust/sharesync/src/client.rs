use crate::batch::BatchScheduler;
use crate::binding::Binding;
use crate::config::SyncConfig;
use crate::item::SubscriptionItem;
use crate::key::ResourceSpec;
use crate::registry::SubscriptionRegistry;
use crate::remote::RemoteClient;
use crate::resource::LiveResource;
use crate::tree::DataTree;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct ShareSyncInner {
    client: Arc<dyn RemoteClient>,
    registry: SubscriptionRegistry<LiveResource>,
    tree: DataTree,
    config: Arc<SyncConfig>,
    next_binding: AtomicU64,
}

/// Owns the registry, the data tree, its batch scheduler and the backend
/// client. Cheap to clone; every clone shares the same state, so separate
/// instances never share subscriptions.
#[derive(Clone)]
pub struct ShareSync {
    inner: Arc<ShareSyncInner>,
}

impl std::fmt::Debug for ShareSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareSync")
            .field("config", &self.inner.config)
            .field("subscriptions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl ShareSync {
    pub fn new<C: RemoteClient>(client: C, config: SyncConfig) -> Self {
        Self::with_client(Arc::new(client), config)
    }

    pub fn with_client(client: Arc<dyn RemoteClient>, config: SyncConfig) -> Self {
        let tree = DataTree::with_max_link_depth(BatchScheduler::new(), config.max_link_depth);
        let registry = SubscriptionRegistry::new(config.teardown_delay);
        Self {
            inner: Arc::new(ShareSyncInner {
                client,
                registry,
                tree,
                config: Arc::new(config),
                next_binding: AtomicU64::new(1),
            }),
        }
    }

    /// Create a standalone item publishing at `slot`. The caller drives its
    /// lifecycle: `init`, `ref_model`, `unref_model`, `destroy`.
    pub fn create_item(
        &self,
        spec: ResourceSpec,
        slot: impl Into<String>,
    ) -> Arc<SubscriptionItem> {
        SubscriptionItem::new(self.clone(), spec, slot.into(), true)
    }

    /// A binding publishing at a fresh `$bindings.<n>` slot.
    pub fn binding(&self) -> Binding {
        let n = self.inner.next_binding.fetch_add(1, Ordering::Relaxed);
        Binding::new(self.clone(), format!("$bindings.{}", n))
    }

    /// A binding publishing at `slot`. Query ids go to the sibling ids slot.
    pub fn binding_at(&self, slot: impl Into<String>) -> Binding {
        Binding::new(self.clone(), slot.into())
    }

    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.tree.scheduler().batch(f)
    }

    pub fn client(&self) -> Arc<dyn RemoteClient> {
        self.inner.client.clone()
    }

    pub fn registry(&self) -> &SubscriptionRegistry<LiveResource> {
        &self.inner.registry
    }

    pub fn tree(&self) -> &DataTree {
        &self.inner.tree
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        self.inner.tree.scheduler()
    }

    pub fn config(&self) -> Arc<SyncConfig> {
        self.inner.config.clone()
    }

    /// Tear down every live subscription now, ignoring grace windows.
    pub fn shutdown(&self) {
        tracing::info!("shutting down {} live subscriptions", self.inner.registry.len());
        self.inner.registry.shutdown();
    }
}
