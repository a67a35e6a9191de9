//! The change-source contract: "list snapshot + change stream".

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{DeltaKind, Resource, Revision, SourceError};

/// Consistent point-in-time listing of the remote collection.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub items: Vec<Resource<T>>,
    pub revision: Revision,
}

/// One item of a change stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Change { kind: DeltaKind, object: Resource<T>, revision: Revision },
    /// Advances the resume point without a change (Kubernetes bookmarks).
    Bookmark(Revision),
}

impl<T> WatchEvent<T> {
    pub fn change(kind: DeltaKind, object: Resource<T>) -> Self {
        let revision = object.meta.revision.clone();
        Self::Change { kind, object, revision }
    }

    pub fn added(object: Resource<T>) -> Self { Self::change(DeltaKind::Added, object) }
    pub fn updated(object: Resource<T>) -> Self { Self::change(DeltaKind::Updated, object) }
    pub fn deleted(object: Resource<T>) -> Self { Self::change(DeltaKind::Deleted, object) }

    pub fn revision(&self) -> &Revision {
        match self {
            WatchEvent::Change { revision, .. } => revision,
            WatchEvent::Bookmark(rv) => rv,
        }
    }
}

/// Change stream. It ends when the source can no longer guarantee continuity
/// from the requested revision; the consumer must then snapshot again.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, SourceError>>;

#[async_trait]
pub trait ChangeSource<T: Send + 'static>: Send + Sync {
    /// Full listing plus the revision it is consistent at.
    async fn snapshot(&self) -> Result<Snapshot<T>, SourceError>;

    /// Open a change stream delivering events strictly after `from`.
    async fn watch(&self, from: &Revision) -> Result<WatchStream<T>, SourceError>;
}
