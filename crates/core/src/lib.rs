//! kmirror core types: resources, object keys, deltas and the change-source contract.

#![forbid(unsafe_code)]

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod error;
pub mod selector;
pub mod source;

pub use config::{BackoffPolicy, InformerConfig};
pub use error::{CacheError, SourceError};
pub use selector::{LabelSelector, SelectorError};
pub use source::{ChangeSource, Snapshot, WatchEvent, WatchStream};

pub type Uid = [u8; 16];

/// Opaque remote revision marker (a Kubernetes `resourceVersion`).
///
/// Only the remote side interprets it; locally it is stored, compared for
/// equality and handed back to [`ChangeSource::watch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    pub fn new(rv: impl Into<String>) -> Self { Self(rv.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Revision {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for Revision {
    fn from(v: String) -> Self { Self(v) }
}

/// Stable cache key: `namespace/name` for namespaced objects, `name` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    /// Keying function: derive the key from object metadata.
    pub fn of(meta: &ObjectMeta) -> Self { Self::new(meta.namespace.as_deref(), &meta.name) }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split back into `(namespace, name)`. Names never contain `/`.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl Borrow<str> for ObjectKey {
    fn borrow(&self) -> &str { &self.0 }
}

impl From<&str> for ObjectKey {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

/// Metadata the cache needs from every resource; the payload stays opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: Option<String>,
    pub name: String,
    pub revision: Revision,
    pub uid: Option<Uid>,
    /// Seconds since epoch; 0 when unknown.
    pub creation_ts: i64,
    pub labels: SmallVec<[(String, String); 8]>,
    pub annotations: SmallVec<[(String, String); 4]>,
}

impl ObjectMeta {
    pub fn new(namespace: Option<&str>, name: &str, revision: impl Into<Revision>) -> Self {
        Self {
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            revision: revision.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.retain(|(k, _)| k != key);
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// A named, versioned remote object as held by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource<T> {
    pub meta: ObjectMeta,
    pub payload: T,
}

impl<T> Resource<T> {
    pub fn new(meta: ObjectMeta, payload: T) -> Self { Self { meta, payload } }
    pub fn key(&self) -> ObjectKey { ObjectKey::of(&self.meta) }
    pub fn namespace(&self) -> Option<&str> { self.meta.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.meta.name }
    pub fn revision(&self) -> &Revision { &self.meta.revision }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
        }
    }
}

/// A single change to one key, carrying the object state it implies.
///
/// `Deleted` deltas carry the last known state of the object. When the
/// deletion was inferred from a relist rather than observed on the stream,
/// `tombstone` is set and the object is whatever the cache last held.
#[derive(Debug)]
pub struct Delta<T> {
    pub kind: DeltaKind,
    pub key: ObjectKey,
    pub object: Arc<Resource<T>>,
    pub revision: Revision,
    /// Produced by a periodic resync rather than by the remote source.
    pub resync: bool,
    pub tombstone: bool,
}

impl<T> Clone for Delta<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            key: self.key.clone(),
            object: Arc::clone(&self.object),
            revision: self.revision.clone(),
            resync: self.resync,
            tombstone: self.tombstone,
        }
    }
}

impl<T> Delta<T> {
    pub fn new(kind: DeltaKind, object: Arc<Resource<T>>) -> Self {
        Self {
            kind,
            key: object.key(),
            revision: object.meta.revision.clone(),
            object,
            resync: false,
            tombstone: false,
        }
    }

    pub fn added(object: Arc<Resource<T>>) -> Self { Self::new(DeltaKind::Added, object) }
    pub fn updated(object: Arc<Resource<T>>) -> Self { Self::new(DeltaKind::Updated, object) }
    pub fn deleted(object: Arc<Resource<T>>) -> Self { Self::new(DeltaKind::Deleted, object) }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }

    pub fn into_resync(mut self) -> Self {
        self.resync = true;
        self
    }

    pub fn into_tombstone(mut self) -> Self {
        self.tombstone = true;
        self
    }
}

/// What registered handlers receive.
#[derive(Debug)]
pub enum Event<T> {
    Delta(Delta<T>),
    /// All objects of a (re)list have been delivered.
    Synced,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        match self {
            Event::Delta(d) => Event::Delta(d.clone()),
            Event::Synced => Event::Synced,
        }
    }
}

impl<T> Event<T> {
    pub fn delta(&self) -> Option<&Delta<T>> {
        match self {
            Event::Delta(d) => Some(d),
            Event::Synced => None,
        }
    }
}

pub mod prelude {
    pub use super::{
        CacheError, ChangeSource, Delta, DeltaKind, Event, InformerConfig, LabelSelector, ObjectKey, ObjectMeta,
        Resource, Revision, Snapshot, SourceError, Uid, WatchEvent, WatchStream,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_for_namespaced_and_cluster_scoped() {
        let ns = ObjectMeta::new(Some("prod"), "web", "1");
        let cluster = ObjectMeta::new(None, "node-a", "1");
        let empty_ns = ObjectMeta::new(Some(""), "node-b", "1");
        assert_eq!(ObjectKey::of(&ns).as_str(), "prod/web");
        assert_eq!(ObjectKey::of(&cluster).as_str(), "node-a");
        assert_eq!(ObjectKey::of(&empty_ns).as_str(), "node-b");
    }

    #[test]
    fn key_splits_back() {
        assert_eq!(ObjectKey::from("prod/web").split(), (Some("prod"), "web"));
        assert_eq!(ObjectKey::from("node-a").split(), (None, "node-a"));
    }

    #[test]
    fn delta_takes_key_and_revision_from_object() {
        let obj = Arc::new(Resource::new(ObjectMeta::new(Some("ns"), "a", "42"), ()));
        let d = Delta::updated(obj);
        assert_eq!(d.key.as_str(), "ns/a");
        assert_eq!(d.revision.as_str(), "42");
        assert!(!d.resync && !d.tombstone);
        let r = d.clone().into_resync();
        assert!(r.resync);
        assert_eq!(r.kind, DeltaKind::Updated);
    }

    #[test]
    fn with_label_replaces_existing_value() {
        let m = ObjectMeta::new(None, "a", "1").with_label("app", "web").with_label("app", "api");
        assert_eq!(m.labels.len(), 1);
        assert_eq!(m.label("app"), Some("api"));
        assert_eq!(m.label("tier"), None);
    }
}
