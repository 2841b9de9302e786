//! Resource identity and declared resource requests.
//!
//! A [`ResourceKey`] names one shared resource. Two requests for the same
//! kind, collection and structurally equal params always produce the same
//! key, which is what lets the registry hand both consumers one underlying
//! subscription.

use crate::error::{Result, SyncError};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Document id substituted when a document is requested without one.
pub const NULL_DOC_ID: &str = "__NULL__";

/// Id matched by the query substituted for a missing query.
pub const NON_EXISTENT_ID: &str = "__NON_EXISTENT__";

/// Collection substituted when the requested collection is unusable.
pub const INVALID_COLLECTION: &str = "__INVALID__";

const VALUE_COLLECTION: &str = "$value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Doc,
    Query,
    QueryAggregate,
    LocalPath,
    Value,
    AsyncCall,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Doc => "doc",
            ResourceKind::Query => "query",
            ResourceKind::QueryAggregate => "query_aggregate",
            ResourceKind::LocalPath => "local",
            ResourceKind::Value => "value",
            ResourceKind::AsyncCall => "async_call",
        }
    }

    /// Kinds backed by a remote subscription shared through the registry.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ResourceKind::Doc | ResourceKind::Query | ResourceKind::QueryAggregate
        )
    }

    /// Kinds whose initialization completes without suspending.
    pub fn is_sync(&self) -> bool {
        matches!(self, ResourceKind::LocalPath | ResourceKind::Value)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    kind: ResourceKind,
    collection: String,
    params: String,
}

impl ResourceKey {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    /// The reserved "non-existent" key for `kind`, used in place of a key
    /// that could not be built from the caller's params.
    pub fn sentinel(kind: ResourceKind, collection: &str) -> Self {
        let collection = if collection.is_empty() {
            INVALID_COLLECTION.to_string()
        } else {
            collection.to_string()
        };
        let params = match kind {
            ResourceKind::Doc => NULL_DOC_ID.to_string(),
            ResourceKind::Query | ResourceKind::QueryAggregate => {
                json!({ "_id": NON_EXISTENT_ID }).to_string()
            }
            _ => Value::Null.to_string(),
        };
        Self {
            kind,
            collection,
            params,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::sentinel(self.kind, &self.collection)
    }

    /// Canonical tree path of the resource's data. The display form is for
    /// logs only: `a:b` + `c` and `a` + `b:c` print the same, so the path
    /// quotes collection and params instead.
    pub fn tree_path(&self) -> String {
        format!("{}{}", self.kind, json!([self.collection, self.params]))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.collection, self.params)
    }
}

/// Serialize params into their canonical form. Strings are used verbatim.
pub fn canonical_params(params: &Value) -> Result<String> {
    match params {
        Value::String(s) => Ok(s.clone()),
        other => Ok(serde_json::to_string(other)?),
    }
}

/// Build the key for a request, validating the shape each kind requires.
pub fn make_key(
    kind: ResourceKind,
    collection: &str,
    params: Option<&Value>,
) -> Result<ResourceKey> {
    if collection.is_empty() {
        return Err(SyncError::InvalidParams(format!(
            "{kind}: collection must be a non-empty string"
        )));
    }

    let params = match (kind, params) {
        (ResourceKind::Doc, None | Some(Value::Null)) => {
            return Err(SyncError::InvalidParams(format!(
                "{kind}: document id is missing for {collection}"
            )));
        }
        (ResourceKind::Query | ResourceKind::QueryAggregate, None | Some(Value::Null)) => {
            return Err(SyncError::InvalidParams(format!(
                "{kind}: query is missing for {collection}"
            )));
        }
        (ResourceKind::Query | ResourceKind::QueryAggregate, Some(query)) if !query.is_object() => {
            return Err(SyncError::InvalidParams(format!(
                "{kind}: query for {collection} must be an object, got {query}"
            )));
        }
        (_, Some(params)) => canonical_params(params)?,
        (_, None) => Value::Null.to_string(),
    };

    Ok(ResourceKey {
        kind,
        collection: collection.to_string(),
        params,
    })
}

/// Queries carrying `$count` or `$aggregate` publish the query's extra value
/// instead of its documents.
pub fn is_aggregate_query(query: &Value) -> bool {
    query
        .as_object()
        .map(|q| q.contains_key("$count") || q.contains_key("$aggregate"))
        .unwrap_or(false)
}

/// `users` -> `userIds`: the slot the ordered ids of a query are published at.
pub fn ids_slot_name(slot: &str) -> String {
    let base = if slot.len() > 1 && (slot.ends_with('s') || slot.ends_with('S')) {
        &slot[..slot.len() - 1]
    } else {
        slot
    };
    format!("{}Ids", base)
}

pub type AsyncFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct AsyncCallSpec {
    pub name: String,
    pub inputs: Value,
    pub call: AsyncFn,
    /// Applied before every call except an item's first one.
    pub debounce: Option<Duration>,
    /// When set, the result is stored at this path and the slot links to it.
    pub path: Option<String>,
}

impl fmt::Debug for AsyncCallSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCallSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("debounce", &self.debounce)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SpecSource {
    Doc { collection: String, id: String },
    Query { collection: String, query: Value },
    Local { path: String },
    Value { value: Value },
    AsyncCall(AsyncCallSpec),
}

/// A resource a binding declares it depends on.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    key: ResourceKey,
    invalid: bool,
    pub(crate) source: SpecSource,
}

impl ResourceSpec {
    /// Subscribe to one document. A missing id falls back to the
    /// `__NULL__` document so the consumer mounts with an empty value.
    pub fn doc(collection: impl Into<String>, id: Option<&str>) -> Self {
        let collection = collection.into();
        let params = id.map(|id| Value::String(id.to_string()));
        match make_key(ResourceKind::Doc, &collection, params.as_ref()) {
            Ok(key) => Self {
                key,
                invalid: false,
                source: SpecSource::Doc {
                    collection,
                    id: id.unwrap_or(NULL_DOC_ID).to_string(),
                },
            },
            Err(err) => {
                tracing::warn!(
                    "{}; falling back to the {} document. Subscribe with an id instead",
                    err,
                    NULL_DOC_ID
                );
                let key = ResourceKey::sentinel(ResourceKind::Doc, &collection);
                Self {
                    source: SpecSource::Doc {
                        collection: key.collection().to_string(),
                        id: NULL_DOC_ID.to_string(),
                    },
                    key,
                    invalid: true,
                }
            }
        }
    }

    /// Subscribe to a query. `$count`/`$aggregate` queries publish the
    /// aggregate instead of the documents.
    pub fn query(collection: impl Into<String>, query: Option<Value>) -> Self {
        let collection = collection.into();
        let kind = match &query {
            Some(q) if is_aggregate_query(q) => ResourceKind::QueryAggregate,
            _ => ResourceKind::Query,
        };
        match make_key(kind, &collection, query.as_ref()) {
            Ok(key) => Self {
                key,
                invalid: false,
                source: SpecSource::Query {
                    collection,
                    query: query.unwrap_or(Value::Null),
                },
            },
            Err(err) => {
                tracing::warn!(
                    "{}; falling back to the {{_id: {}}} query",
                    err,
                    NON_EXISTENT_ID
                );
                let key = ResourceKey::sentinel(kind, &collection);
                Self {
                    source: SpecSource::Query {
                        collection: key.collection().to_string(),
                        query: json!({ "_id": NON_EXISTENT_ID }),
                    },
                    key,
                    invalid: true,
                }
            }
        }
    }

    /// Mirror an in-process path of the data tree.
    pub fn local(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let key = make_key(ResourceKind::LocalPath, &path, None)?;
        Ok(Self {
            key,
            invalid: false,
            source: SpecSource::Local { path },
        })
    }

    /// Publish a fixed value.
    pub fn value(value: Value) -> Self {
        let key = make_key(ResourceKind::Value, VALUE_COLLECTION, Some(&value))
            .unwrap_or_else(|_| ResourceKey::sentinel(ResourceKind::Value, VALUE_COLLECTION));
        Self {
            key,
            invalid: false,
            source: SpecSource::Value { value },
        }
    }

    /// Publish the result of `call(inputs)`.
    pub fn async_call<F>(name: impl Into<String>, inputs: Value, call: F) -> Result<Self>
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        let name = name.into();
        let key = make_key(
            ResourceKind::AsyncCall,
            &name,
            Some(&json!({ "inputs": inputs, "path": Value::Null })),
        )?;
        Ok(Self {
            key,
            invalid: false,
            source: SpecSource::AsyncCall(AsyncCallSpec {
                name,
                inputs,
                call: Arc::new(call),
                debounce: None,
                path: None,
            }),
        })
    }

    /// Debounce non-first invocations of an async call. No effect on other kinds.
    pub fn with_debounce(mut self, delay: Duration) -> Self {
        if let SpecSource::AsyncCall(spec) = &mut self.source {
            spec.debounce = Some(delay);
        }
        self
    }

    /// Store an async call's result at `path`. No effect on other kinds.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if let SpecSource::AsyncCall(spec) = &mut self.source {
            let path = path.into();
            if let Ok(key) = make_key(
                ResourceKind::AsyncCall,
                &spec.name,
                Some(&json!({ "inputs": spec.inputs, "path": path })),
            ) {
                self.key = key;
            }
            spec.path = Some(path);
        }
        self
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn kind(&self) -> ResourceKind {
        self.key.kind
    }

    /// True when the caller's params were unusable and the sentinel was substituted.
    pub fn is_invalid(&self) -> bool {
        self.invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn test_string_params_are_verbatim() {
        let key = make_key(ResourceKind::Doc, "users", Some(&json!("u1"))).unwrap();
        assert_eq!(key.params(), "u1");
        assert_eq!(key.to_string(), "doc:users:u1");
        assert_eq!(key.tree_path(), r#"doc["users","u1"]"#);
    }

    #[test]
    fn test_tree_paths_do_not_collide_when_display_does() {
        let x = make_key(ResourceKind::Doc, "a:b", Some(&json!("c"))).unwrap();
        let y = make_key(ResourceKind::Doc, "a", Some(&json!("b:c"))).unwrap();
        assert_ne!(x, y);
        assert_eq!(x.to_string(), y.to_string());
        assert_ne!(x.tree_path(), y.tree_path());
    }

    #[test]
    fn test_structurally_equal_params_share_a_key() {
        let a = make_key(
            ResourceKind::Query,
            "users",
            Some(&json!({"active": true, "age": {"$gt": 18}})),
        )
        .unwrap();
        let b = make_key(
            ResourceKind::Query,
            "users",
            Some(&json!({"active": true, "age": {"$gt": 18}})),
        )
        .unwrap();
        assert_eq!(a, b);

        let c = make_key(ResourceKind::Query, "users", Some(&json!({"active": false}))).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_kind_is_part_of_identity() {
        let doc = make_key(ResourceKind::Doc, "users", Some(&json!("u1"))).unwrap();
        let local = make_key(ResourceKind::LocalPath, "users", Some(&json!("u1"))).unwrap();
        assert_ne!(doc, local);
    }

    #[test]
    fn test_make_key_rejects_bad_shapes() {
        assert!(matches!(
            make_key(ResourceKind::Doc, "", Some(&json!("u1"))),
            Err(SyncError::InvalidParams(_))
        ));
        assert!(matches!(
            make_key(ResourceKind::Doc, "users", None),
            Err(SyncError::InvalidParams(_))
        ));
        assert!(matches!(
            make_key(ResourceKind::Query, "users", Some(&json!([1, 2]))),
            Err(SyncError::InvalidParams(_))
        ));
        assert!(matches!(
            make_key(ResourceKind::Query, "users", Some(&Value::Null)),
            Err(SyncError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_doc_without_id_falls_back_to_sentinel() {
        let spec = ResourceSpec::doc("users", None);
        assert!(spec.is_invalid());
        assert!(spec.key().is_sentinel());
        assert_eq!(spec.key().params(), NULL_DOC_ID);
        assert_eq!(spec.key().collection(), "users");
    }

    #[test]
    fn test_query_with_bad_collection_falls_back_to_sentinel() {
        let spec = ResourceSpec::query("", Some(json!({"active": true})));
        assert!(spec.is_invalid());
        assert_eq!(spec.key().collection(), INVALID_COLLECTION);
        assert_eq!(spec.kind(), ResourceKind::Query);
    }

    #[test]
    fn test_scalar_query_falls_back_to_sentinel() {
        let spec = ResourceSpec::query("users", Some(json!("active")));
        assert!(spec.is_invalid());
        assert!(spec.key().is_sentinel());
    }

    #[test]
    fn test_aggregate_query_classification() {
        let spec = ResourceSpec::query("users", Some(json!({"$count": true, "active": true})));
        assert_eq!(spec.kind(), ResourceKind::QueryAggregate);

        let spec = ResourceSpec::query("users", Some(json!({"active": true})));
        assert_eq!(spec.kind(), ResourceKind::Query);
    }

    #[test]
    fn test_ids_slot_name() {
        assert_eq!(ids_slot_name("users"), "userIds");
        assert_eq!(ids_slot_name("team"), "teamIds");
        assert_eq!(ids_slot_name("s"), "sIds");
    }

    #[test]
    fn test_async_call_key_tracks_inputs_and_path() {
        let call = |v: Value| -> BoxFuture<'static, Result<Value>> { async move { Ok(v) }.boxed() };
        let a = ResourceSpec::async_call("search", json!({"q": "a"}), call).unwrap();
        let b = ResourceSpec::async_call("search", json!({"q": "b"}), call).unwrap();
        assert_ne!(a.key(), b.key());

        let with_path = a.clone().with_path("_page.results");
        assert_ne!(a.key(), with_path.key());
        assert!(ResourceSpec::async_call("", json!({}), call).is_err());
    }

    #[test]
    fn test_local_requires_path() {
        assert!(ResourceSpec::local("").is_err());
        let spec = ResourceSpec::local("_session.user").unwrap();
        assert_eq!(spec.kind(), ResourceKind::LocalPath);
        assert!(spec.kind().is_sync());
    }
}
