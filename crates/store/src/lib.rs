//! kmirror store: ordered delta queue, indexed store and read-only listers.

#![forbid(unsafe_code)]

pub mod indexed;
pub mod lister;
pub mod queue;

pub use indexed::{label_index_func, namespace_index_func, IndexFunc, IndexedStore, NAMESPACE_INDEX};
pub use lister::{Lister, NamespaceLister};
pub use queue::{DeltaQueue, KnownObjects, Push, QueueItem, ReplaceStats};
