//! Read-only listers over an [`IndexedStore`]. Never touch the network.

use std::sync::Arc;

use kmirror_core::{LabelSelector, ObjectKey, Resource};

use crate::indexed::{IndexedStore, NAMESPACE_INDEX};

pub struct Lister<T> {
    store: Arc<IndexedStore<T>>,
}

impl<T> Clone for Lister<T> {
    fn clone(&self) -> Self { Self { store: Arc::clone(&self.store) } }
}

impl<T: 'static> Lister<T> {
    pub fn new(store: Arc<IndexedStore<T>>) -> Self { Self { store } }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<Resource<T>>> {
        self.store.get(ObjectKey::new(namespace, name).as_str())
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<Resource<T>>> { self.store.get(key) }

    /// Objects in `namespace` (`""` selects cluster-scoped objects), sorted by key.
    pub fn list(&self, namespace: &str) -> Vec<Arc<Resource<T>>> {
        if self.store.has_index(NAMESPACE_INDEX) {
            if let Ok(items) = self.store.objects_by_index(NAMESPACE_INDEX, namespace) {
                return items;
            }
        }
        self.list_matching(|o| o.namespace().unwrap_or("") == namespace)
    }

    pub fn list_all(&self) -> Vec<Arc<Resource<T>>> { self.store.list_all() }

    pub fn list_matching(&self, pred: impl Fn(&Resource<T>) -> bool) -> Vec<Arc<Resource<T>>> {
        self.store.list_all().into_iter().filter(|o| pred(o)).collect()
    }

    pub fn list_selected(&self, selector: &LabelSelector) -> Vec<Arc<Resource<T>>> {
        self.list_matching(|o| selector.matches(&o.meta.labels))
    }

    pub fn namespaced(&self, namespace: &str) -> NamespaceLister<T> {
        NamespaceLister { store: Arc::clone(&self.store), namespace: namespace.to_string() }
    }

    pub fn len(&self) -> usize { self.store.len() }

    pub fn is_empty(&self) -> bool { self.store.is_empty() }
}

/// Lister scoped to one namespace.
pub struct NamespaceLister<T> {
    store: Arc<IndexedStore<T>>,
    namespace: String,
}

impl<T: 'static> NamespaceLister<T> {
    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn get(&self, name: &str) -> Option<Arc<Resource<T>>> {
        self.store.get(ObjectKey::new(Some(&self.namespace), name).as_str())
    }

    pub fn list(&self) -> Vec<Arc<Resource<T>>> { Lister::new(Arc::clone(&self.store)).list(&self.namespace) }

    pub fn list_selected(&self, selector: &LabelSelector) -> Vec<Arc<Resource<T>>> {
        self.list().into_iter().filter(|o| selector.matches(&o.meta.labels)).collect()
    }
}
