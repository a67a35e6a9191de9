//! Thread-safe indexed store: primary table plus incrementally maintained secondary indices.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kmirror_core::{CacheError, Delta, DeltaKind, ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::queue::KnownObjects;

/// Derives the index values of an object. An object may have several.
pub type IndexFunc<T> = Arc<dyn Fn(&Resource<T>) -> Vec<String> + Send + Sync>;

/// Name of the index installed by [`IndexedStore::with_namespace_index`].
pub const NAMESPACE_INDEX: &str = "namespace";

/// Index objects by namespace; cluster-scoped objects land under `""`.
pub fn namespace_index_func<T: 'static>() -> IndexFunc<T> {
    Arc::new(|o: &Resource<T>| vec![o.namespace().unwrap_or("").to_string()])
}

/// Index objects by the value of one label; objects without it are not indexed.
pub fn label_index_func<T: 'static>(label: &str) -> IndexFunc<T> {
    let label = label.to_string();
    Arc::new(move |o: &Resource<T>| o.meta.label(&label).map(|v| vec![v.to_string()]).unwrap_or_default())
}

type Postings = FxHashMap<String, FxHashSet<ObjectKey>>;

struct Inner<T> {
    items: FxHashMap<ObjectKey, Arc<Resource<T>>>,
    indexers: FxHashMap<String, IndexFunc<T>>,
    indices: FxHashMap<String, Postings>,
}

fn values_of<T>(f: &IndexFunc<T>, obj: Option<&Arc<Resource<T>>>) -> FxHashSet<String> {
    obj.map(|o| f(o).into_iter().collect()).unwrap_or_default()
}

impl<T> Inner<T> {
    /// Move `key` from the postings of `old` to those of `new` in every index.
    fn reindex(
        &mut self,
        key: &ObjectKey,
        old: Option<&Arc<Resource<T>>>,
        new: Option<&Arc<Resource<T>>>,
    ) -> Result<(), CacheError> {
        let Inner { indexers, indices, .. } = self;
        for (name, f) in indexers.iter() {
            let before = values_of(f, old);
            let after = values_of(f, new);
            let postings = indices.entry(name.clone()).or_default();
            for v in before.difference(&after) {
                let removed = match postings.get_mut(v) {
                    Some(set) => {
                        let hit = set.remove(key);
                        if set.is_empty() {
                            postings.remove(v);
                        }
                        hit
                    }
                    None => false,
                };
                if !removed {
                    return Err(CacheError::IndexDrift(format!("{}: {} missing from {:?}", name, key, v)));
                }
            }
            for v in after.difference(&before) {
                postings.entry(v.clone()).or_default().insert(key.clone());
            }
        }
        Ok(())
    }
}

/// Key → object table with secondary indices.
///
/// Mutations take the write lock for the primary table and every index at
/// once, so readers never see an object without its postings or vice versa.
pub struct IndexedStore<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: 'static> Default for IndexedStore<T> {
    fn default() -> Self { Self::new() }
}

impl<T: 'static> IndexedStore<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: FxHashMap::default(),
                indexers: FxHashMap::default(),
                indices: FxHashMap::default(),
            }),
        }
    }

    pub fn with_namespace_index() -> Self {
        let store = Self::new();
        {
            let mut inner = store.write();
            inner.indexers.insert(NAMESPACE_INDEX.to_string(), namespace_index_func());
            inner.indices.insert(NAMESPACE_INDEX.to_string(), Postings::default());
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an index and build it over the current content.
    pub fn add_indexer(&self, name: &str, f: IndexFunc<T>) -> Result<(), CacheError> {
        let mut inner = self.write();
        if inner.indexers.contains_key(name) {
            return Err(CacheError::IndexExists(name.to_string()));
        }
        let mut postings = Postings::default();
        for (key, obj) in inner.items.iter() {
            for v in values_of(&f, Some(obj)) {
                postings.entry(v).or_default().insert(key.clone());
            }
        }
        inner.indexers.insert(name.to_string(), f);
        inner.indices.insert(name.to_string(), postings);
        Ok(())
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().indexers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_index(&self, name: &str) -> bool { self.read().indexers.contains_key(name) }

    /// Apply one delta: upsert for Added/Updated, removal for Deleted.
    /// Applying the same delta twice leaves the same state as applying it once.
    pub fn apply(&self, delta: &Delta<T>) -> Result<(), CacheError> {
        let mut inner = self.write();
        let result = match delta.kind {
            DeltaKind::Added | DeltaKind::Updated => {
                let new = Arc::clone(&delta.object);
                let old = inner.items.insert(delta.key.clone(), Arc::clone(&new));
                inner.reindex(&delta.key, old.as_ref(), Some(&new))
            }
            DeltaKind::Deleted => match inner.items.remove(&delta.key) {
                Some(old) => inner.reindex(&delta.key, Some(&old), None),
                None => Ok(()),
            },
        };
        metrics::gauge!("store_objects", inner.items.len() as f64);
        result
    }

    pub fn get(&self, key: &str) -> Option<Arc<Resource<T>>> { self.read().items.get(key).cloned() }

    pub fn contains(&self, key: &str) -> bool { self.read().items.contains_key(key) }

    /// Keys whose index `name` contains `value`, sorted.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<ObjectKey>, CacheError> {
        let inner = self.read();
        let postings = inner.indices.get(name).ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        let mut keys: Vec<ObjectKey> = postings.get(value).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    /// Objects whose index `name` contains `value`, sorted by key.
    pub fn objects_by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<Resource<T>>>, CacheError> {
        let inner = self.read();
        let postings = inner.indices.get(name).ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        let mut out: Vec<Arc<Resource<T>>> = postings
            .get(value)
            .map(|s| s.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    /// Values the object stored under `key` has in index `name`, sorted.
    /// Empty when the key is not stored.
    pub fn index_values(&self, name: &str, key: &str) -> Result<Vec<String>, CacheError> {
        let inner = self.read();
        let f = inner.indexers.get(name).ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        let mut values: Vec<String> = values_of(f, inner.items.get(key)).into_iter().collect();
        values.sort();
        Ok(values)
    }

    /// Distinct values currently present in index `name`, sorted.
    pub fn list_index_values(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let inner = self.read();
        let postings = inner.indices.get(name).ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?;
        let mut values: Vec<String> = postings.keys().cloned().collect();
        values.sort();
        Ok(values)
    }

    pub fn list_all(&self) -> Vec<Arc<Resource<T>>> {
        let inner = self.read();
        let mut out: Vec<(&ObjectKey, &Arc<Resource<T>>)> = inner.items.iter().collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out.into_iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().items.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Rebuild every index from the primary table and compare.
    pub fn verify(&self) -> Result<(), CacheError> {
        let inner = self.read();
        for (name, f) in inner.indexers.iter() {
            let mut expected = Postings::default();
            for (key, obj) in inner.items.iter() {
                for v in values_of(f, Some(obj)) {
                    expected.entry(v).or_default().insert(key.clone());
                }
            }
            if inner.indices.get(name) != Some(&expected) {
                return Err(CacheError::IndexDrift(format!("index {} does not match primary table", name)));
            }
        }
        Ok(())
    }
}

impl<T: Send + Sync + 'static> KnownObjects<T> for IndexedStore<T> {
    fn list_known(&self) -> Vec<Arc<Resource<T>>> { self.list_all() }
}
