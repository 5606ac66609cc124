//! Herald core types: object keys, the managed object model and the store contract.
//!
//! Everything above this crate talks to the remote store only through
//! [`ResourceStore`]; the wire format lives in the backing implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use metrics::counter;
use serde::{Deserialize, Serialize};

pub mod message;

pub use message::{Message, MessageSpec, MessageStatus};

pub mod prelude {
    pub use super::{
        ErrorSink, KeyError, Message, MessageSpec, MessageStatus, Object, ObjectKey, ObjectList,
        ObjectMeta, ResourceStore, Selector, StoreError, StoreResult, TracingErrorSink, WatchEvent,
        WatchStream,
    };
}

/// Metadata shared by every managed object. Field names follow the Kubernetes
/// serialization so objects round-trip through a JSON API unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Empty for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Opaque version assigned by the store on every write; used for optimistic concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// RFC 3339 timestamp assigned by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A declaratively managed object: desired state owned by its author, observed
/// state (`Status`) owned by the controller.
///
/// Equality is a full structural comparison (derived `PartialEq`), not a
/// resource-version shortcut, so silent mutations are never missed.
pub trait Object: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    type Status: Clone + PartialEq + fmt::Debug + Send + Sync;

    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::for_object(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no name (namespace {namespace:?})")]
    MissingName { namespace: String },
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

/// Identity of a managed object: `(namespace, name)`.
///
/// Text form is `namespace/name`, or just `name` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn for_object<K: Object>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        if meta.name.is_empty() {
            return Err(KeyError::MissingName { namespace: meta.namespace.clone() });
        }
        Ok(Self::new(meta.namespace.clone(), meta.name.clone()))
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (namespace, name) = match parts.as_slice() {
            [name] => ("", *name),
            [namespace, name] => (*namespace, *name),
            _ => return Err(KeyError::Malformed(s.to_string())),
        };
        if name.is_empty() {
            return Err(KeyError::MissingName { namespace: namespace.to_string() });
        }
        Ok(Self::new(namespace, name))
    }
}

/// Scope of a list/watch: optional namespace plus equality label matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), labels: BTreeMap::new() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ns) = &self.namespace {
            if *ns != meta.namespace {
                return false;
            }
        }
        self.labels.iter().all(|(k, v)| meta.labels.get(k) == Some(v))
    }

    /// Label selector in `k=v,k2=v2` form, `None` when no labels are set.
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Some(parts.join(","))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(ObjectKey),
    #[error("conflict: {key}: {message}")]
    Conflict { key: ObjectKey, message: String },
    /// The requested resource version is no longer retained; the caller must relist.
    #[error("gone: {0}")]
    Gone(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Incremental change delivered by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }

}

/// Result of a full listing; `resource_version` is where a following watch resumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

pub type WatchStream<K> = BoxStream<'static, StoreResult<WatchEvent<K>>>;

/// Capability set the controller needs from the remote store.
///
/// Implementations must keep list-then-watch consistent (a watch opened at a
/// list's `resource_version` loses no events) and must report a stale
/// `resource_version` on write as [`StoreError::Conflict`].
#[async_trait]
pub trait ResourceStore<K: Object>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<K>;

    async fn list(&self, selector: &Selector) -> StoreResult<ObjectList<K>>;

    /// Stream changes newer than `resource_version`.
    async fn watch(&self, selector: &Selector, resource_version: &str) -> StoreResult<WatchStream<K>>;

    /// Full-object write. The stored status is left untouched.
    async fn update(&self, obj: &K) -> StoreResult<K>;

    /// Status-only write.
    async fn update_status(&self, obj: &K) -> StoreResult<K>;
}

/// Destination for non-fatal errors raised anywhere in the control loop.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &(dyn std::error::Error + 'static));
}

/// Default sink: log through `tracing` and count.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, err: &(dyn std::error::Error + 'static)) {
        counter!("herald_errors_reported", 1u64);
        match err.source() {
            Some(src) => tracing::error!(error = %err, source = %src, "error reported"),
            None => tracing::error!(error = %err, "error reported"),
        }
    }
}
