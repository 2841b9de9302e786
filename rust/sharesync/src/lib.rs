//! # sharesync
//!
//! Reference-counted shared subscriptions for live document and query data.
//!
//! Consumers declare the resources they need through a [`Binding`]. Every
//! consumer of the same resource shares one backend subscription, owned by
//! the [`SubscriptionRegistry`] and kept alive for a short grace window
//! after its last consumer leaves, so fast remounts never resubscribe.
//! Published data lives in a [`DataTree`]; writes are coalesced by the
//! [`BatchScheduler`] so each observer is notified at most once per batch.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sharesync::prelude::*;
//!
//! let backend = MemoryBackend::new();
//! let sync = ShareSync::new(backend.clone(), SyncConfig::default());
//!
//! let users = sync.binding_at("users");
//! users.declare(ResourceSpec::query("users", Some(json!({"active": true}))));
//!
//! let observer = sync.tree().observer(Notifier::new(|| println!("users changed")));
//! observer.track(|view| view.read("users"));
//! ```
//!
//! ## Resource kinds
//!
//! - **Doc** - One remote document
//! - **Query** - Ordered remote query results, plus their ids
//! - **QueryAggregate** - The aggregate value of a `$count`/`$aggregate` query
//! - **LocalPath** - A path of the local data tree
//! - **Value** - A fixed value
//! - **AsyncCall** - The result of an async function, optionally debounced

mod batch;
mod binding;
mod client;
mod config;
mod counter;
mod error;
mod item;
mod key;
pub mod prelude;
mod registry;
pub mod remote;
mod resource;
pub mod telemetry;
mod tree;

pub use batch::{BatchScheduler, Notifier};
pub use binding::Binding;
pub use client::ShareSync;
pub use config::{
    SyncConfig, DEFAULT_IGNORED_FIELDS, DEFAULT_MAX_LINK_DEPTH, DEFAULT_TEARDOWN_DELAY,
};
pub use counter::RefCounter;
pub use error::{Result, SyncError};
pub use item::{ItemState, SubscriptionItem};
pub use key::{
    canonical_params, ids_slot_name, is_aggregate_query, make_key, AsyncCallSpec, AsyncFn,
    ResourceKey, ResourceKind, ResourceSpec, INVALID_COLLECTION, NON_EXISTENT_ID, NULL_DOC_ID,
};
pub use registry::{EntryState, SubscriptionRegistry, Teardown};
pub use remote::{
    ChangeEvent, MemoryBackend, RemoteClient, RemoteDoc, RemoteFeed, Snapshot, SubscriptionHandle,
};
pub use resource::{ids_path, LiveResource, RemoteTarget};
pub use tree::{DataTree, Observer};

pub use serde_json::{json, Value};
