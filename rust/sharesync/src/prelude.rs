//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sharesync::prelude::*;
//!
//! let sync = ShareSync::new(MemoryBackend::new(), SyncConfig::default());
//! let user = sync.binding();
//! user.declare(ResourceSpec::doc("users", Some("u1")));
//! ```

pub use crate::{
    json, Binding, ChangeEvent, DataTree, MemoryBackend, Notifier, Observer, RemoteClient,
    RemoteDoc, ResourceKey, ResourceKind, ResourceSpec, ShareSync, SubscriptionItem, SyncConfig,
    SyncError, Value,
};
