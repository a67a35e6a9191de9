//! Informer registry: one shared informer per resource kind.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kmirror_core::{CacheError, ChangeSource, InformerConfig};
use kmirror_store::Lister;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::informer::SharedInformer;

/// Type-erased lifecycle view of a [`SharedInformer`].
#[async_trait]
trait ManagedInformer: Send + Sync {
    fn start_on(&self, handle: &Handle) -> Result<(), CacheError>;
    fn has_synced(&self) -> bool;
    async fn wait_for_sync(&self) -> Result<(), CacheError>;
    async fn stop(&self) -> Result<(), CacheError>;
}

#[async_trait]
impl<T: Send + Sync + 'static> ManagedInformer for SharedInformer<T> {
    fn start_on(&self, handle: &Handle) -> Result<(), CacheError> { SharedInformer::start_on(self, handle) }
    fn has_synced(&self) -> bool { SharedInformer::has_synced(self) }
    async fn wait_for_sync(&self) -> Result<(), CacheError> { SharedInformer::wait_for_sync(self).await }
    async fn stop(&self) -> Result<(), CacheError> { SharedInformer::stop(self).await }
}

struct Entry {
    typed: Arc<dyn Any + Send + Sync>,
    managed: Arc<dyn ManagedInformer>,
}

/// Hands out the same [`SharedInformer`] to every caller asking for a kind.
pub struct InformerFactory {
    config: InformerConfig,
    entries: Mutex<BTreeMap<String, Entry>>,
    started: AtomicBool,
    /// Runtime captured by `start_all`; later registrations spawn onto it.
    runtime: Mutex<Option<Handle>>,
}

impl Default for InformerFactory {
    fn default() -> Self { Self::new(InformerConfig::default()) }
}

impl InformerFactory {
    pub fn new(config: InformerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(BTreeMap::new()),
            started: AtomicBool::new(false),
            runtime: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Informer and lister for `kind`, building the informer on first use.
    ///
    /// `make_source` runs at most once per kind, even under concurrent first
    /// access. Asking for a known kind with another payload type fails with
    /// [`CacheError::TypeMismatch`]. Informers created after [`start_all`](Self::start_all)
    /// start immediately on the runtime `start_all` ran in, so callers may be
    /// outside any runtime.
    pub fn for_resource<T, F>(&self, kind: &str, make_source: F) -> Result<(Arc<SharedInformer<T>>, Lister<T>), CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<dyn ChangeSource<T>>,
    {
        self.for_resource_with(kind, self.config.clone(), make_source)
    }

    /// Like [`for_resource`](Self::for_resource) with a per-kind config (resync
    /// period, backoff, namespace index). Ignored when the kind already exists.
    pub fn for_resource_with<T, F>(
        &self,
        kind: &str,
        config: InformerConfig,
        make_source: F,
    ) -> Result<(Arc<SharedInformer<T>>, Lister<T>), CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<dyn ChangeSource<T>>,
    {
        let mut entries = self.lock();
        if let Some(entry) = entries.get(kind) {
            let informer = Arc::clone(&entry.typed)
                .downcast::<SharedInformer<T>>()
                .map_err(|_| CacheError::TypeMismatch(kind.to_string()))?;
            let lister = informer.lister();
            return Ok((informer, lister));
        }
        let informer = Arc::new(SharedInformer::new(kind, make_source(), config));
        if self.started.load(Ordering::SeqCst) {
            match self.runtime.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                Some(handle) => informer.start_on(handle)?,
                None => informer.start()?,
            }
        }
        let typed: Arc<dyn Any + Send + Sync> = informer.clone();
        let managed: Arc<dyn ManagedInformer> = informer.clone();
        entries.insert(kind.to_string(), Entry { typed, managed });
        debug!(kind = %kind, "factory: informer created");
        let lister = informer.lister();
        Ok((informer, lister))
    }

    fn managed(&self) -> Vec<(String, Arc<dyn ManagedInformer>)> {
        self.lock().iter().map(|(k, e)| (k.clone(), Arc::clone(&e.managed))).collect()
    }

    /// Start every registered informer not yet running on the current tokio
    /// runtime. Later registrations start on creation.
    pub fn start_all(&self) -> Result<(), CacheError> {
        let handle = Handle::try_current().map_err(|_| CacheError::NoRuntime("factory".to_string()))?;
        *self.runtime.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        self.started.store(true, Ordering::SeqCst);
        let mut started = 0usize;
        for (kind, inf) in self.managed() {
            match inf.start_on(&handle) {
                Ok(()) => started += 1,
                Err(CacheError::AlreadyStarted(_)) => {}
                Err(e) => {
                    warn!(kind = %kind, error = %e, "factory: start failed");
                    return Err(e);
                }
            }
        }
        info!(started, "factory: informers started");
        Ok(())
    }

    /// Wait until every registered informer has synced; the first failure wins.
    pub async fn wait_for_cache_sync(&self) -> Result<(), CacheError> {
        for (kind, inf) in self.managed() {
            if inf.has_synced() {
                continue;
            }
            inf.wait_for_sync().await.map_err(|e| {
                warn!(kind = %kind, error = %e, "factory: cache sync failed");
                e
            })?;
        }
        Ok(())
    }

    /// Stop every informer. All are stopped even if some report a failure;
    /// the first failure is returned.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        let mut first_err = None;
        for (kind, inf) in self.managed() {
            if let Err(e) = inf.stop().await {
                warn!(kind = %kind, error = %e, "factory: informer ended in failure");
                first_err.get_or_insert(e);
            }
        }
        info!("factory: shutdown complete");
        first_err.map_or(Ok(()), Err)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> { self.lock().keys().cloned().collect() }
}
