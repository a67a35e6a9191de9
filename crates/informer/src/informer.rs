//! Shared informer: one reflector, one queue, one store and a drain loop fanning out to handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use kmirror_core::{CacheError, ChangeSource, Delta, Event, InformerConfig, Revision};
use kmirror_store::{DeltaQueue, IndexFunc, IndexedStore, KnownObjects, Lister, QueueItem};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{EventHandler, HandlerId};
use crate::reflector::{Reflector, ReflectorPhase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InformerState {
    Pending,
    Running,
    Stopped,
    Failed(CacheError),
}

impl InformerState {
    pub fn is_terminal(&self) -> bool { matches!(self, InformerState::Stopped | InformerState::Failed(_)) }
}

enum Control<T> {
    Add(HandlerId, Arc<dyn EventHandler<T>>),
    Remove(HandlerId),
}

struct Registered<T> {
    id: HandlerId,
    handler: Arc<dyn EventHandler<T>>,
}

/// Everything the drain task needs, detached from the informer handle.
struct Drain<T> {
    name: String,
    queue: Arc<DeltaQueue<T>>,
    store: Arc<IndexedStore<T>>,
    state: Arc<watch::Sender<InformerState>>,
    synced: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    handlers: Vec<Registered<T>>,
}

impl<T: Send + Sync + 'static> Drain<T> {
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control<T>>) {
        debug!(informer = %self.name, "informer: drain loop started");
        loop {
            let item = tokio::select! {
                biased;
                Some(ctl) = control.recv() => {
                    self.control(ctl);
                    continue;
                }
                item = self.queue.dequeue() => item,
            };
            let Some(item) = item else { break };
            match item {
                QueueItem::Delta(delta) => {
                    let applied = self.store.apply(&delta);
                    self.queue.done();
                    if let Err(e) = applied {
                        error!(informer = %self.name, key = %delta.key, error = %e, "informer: store invariant violated");
                        fail(&self.state, &self.cancel, &self.queue, e);
                        break;
                    }
                    metrics::counter!("informer_deltas_applied_total", 1u64, "kind" => delta.kind.as_str());
                    self.dispatch(&Event::Delta(delta));
                }
                QueueItem::Synced => {
                    if !*self.synced.borrow() {
                        info!(informer = %self.name, objects = self.store.len(), "informer: synced");
                    }
                    self.synced.send_replace(true);
                    self.dispatch(&Event::Synced);
                }
            }
        }
        debug!(informer = %self.name, "informer: drain loop ended");
    }

    fn control(&mut self, ctl: Control<T>) {
        match ctl {
            Control::Add(id, handler) => {
                let reg = Registered { id, handler };
                let existing = self.store.list_all();
                if !existing.is_empty() {
                    debug!(informer = %self.name, handler = %id, objects = existing.len(), "informer: replaying store to late handler");
                }
                for obj in existing {
                    invoke(&self.name, &reg, &Event::Delta(Delta::added(obj)));
                }
                self.handlers.push(reg);
            }
            Control::Remove(id) => {
                let before = self.handlers.len();
                self.handlers.retain(|r| r.id != id);
                if self.handlers.len() == before {
                    debug!(informer = %self.name, handler = %id, "informer: remove of unknown handler");
                }
            }
        }
    }

    fn dispatch(&self, event: &Event<T>) {
        let t0 = Instant::now();
        for reg in &self.handlers {
            invoke(&self.name, reg, event);
        }
        metrics::histogram!("informer_dispatch_ms", t0.elapsed().as_secs_f64() * 1000.0);
    }
}

fn invoke<T>(name: &str, reg: &Registered<T>, event: &Event<T>) {
    match catch_unwind(AssertUnwindSafe(|| reg.handler.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            metrics::counter!("informer_handler_errors_total", 1u64);
            warn!(informer = %name, handler = %reg.id, error = %e, "informer: handler failed");
        }
        Err(_) => {
            metrics::counter!("informer_handler_errors_total", 1u64);
            error!(informer = %name, handler = %reg.id, "informer: handler panicked");
        }
    }
}

fn fail<T>(state: &watch::Sender<InformerState>, cancel: &CancellationToken, queue: &DeltaQueue<T>, err: CacheError) {
    state.send_replace(InformerState::Failed(err));
    cancel.cancel();
    queue.close();
}

/// Mirrors one resource kind into an [`IndexedStore`] and notifies handlers.
///
/// Only the drain task mutates the store. Handlers see every delta after it
/// has been applied, in per-key order, one at a time.
pub struct SharedInformer<T> {
    name: String,
    config: InformerConfig,
    source: Arc<dyn ChangeSource<T>>,
    queue: Arc<DeltaQueue<T>>,
    store: Arc<IndexedStore<T>>,
    control_tx: mpsc::UnboundedSender<Control<T>>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Control<T>>>>,
    next_handler: AtomicU64,
    cursor: Mutex<Option<Arc<ArcSwapOption<Revision>>>>,
    phase: Mutex<Option<watch::Receiver<ReflectorPhase>>>,
    state: Arc<watch::Sender<InformerState>>,
    synced: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<G>(m: &Mutex<G>) -> MutexGuard<'_, G> { m.lock().unwrap_or_else(PoisonError::into_inner) }

impl<T: Send + Sync + 'static> SharedInformer<T> {
    pub fn new(name: impl Into<String>, source: Arc<dyn ChangeSource<T>>, config: InformerConfig) -> Self {
        let store = if config.namespace_index { IndexedStore::with_namespace_index() } else { IndexedStore::new() };
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(InformerState::Pending);
        let (synced, _) = watch::channel(false);
        Self {
            name: name.into(),
            config,
            source,
            queue: Arc::new(DeltaQueue::new()),
            store: Arc::new(store),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            next_handler: AtomicU64::new(1),
            cursor: Mutex::new(None),
            phase: Mutex::new(None),
            state: Arc::new(state),
            synced: Arc::new(synced),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Spawn the reflector and drain tasks on the current tokio runtime.
    pub fn start(&self) -> Result<(), CacheError> {
        let handle = Handle::try_current().map_err(|_| CacheError::NoRuntime(self.name.clone()))?;
        self.start_on(&handle)
    }

    /// Spawn the reflector and drain tasks on `handle`.
    pub fn start_on(&self, handle: &Handle) -> Result<(), CacheError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CacheError::AlreadyStarted(self.name.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(CacheError::Stopped(self.name.clone()));
        }
        let Some(control_rx) = lock(&self.control_rx).take() else {
            return Err(CacheError::AlreadyStarted(self.name.clone()));
        };

        let known: Arc<dyn KnownObjects<T>> = self.store.clone();
        let reflector =
            Reflector::new(&self.name, Arc::clone(&self.source), Arc::clone(&self.queue), known, self.config.clone());
        *lock(&self.cursor) = Some(reflector.cursor());
        *lock(&self.phase) = Some(reflector.phase());

        let drain = Drain {
            name: self.name.clone(),
            queue: Arc::clone(&self.queue),
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            synced: Arc::clone(&self.synced),
            cancel: self.cancel.clone(),
            handlers: Vec::new(),
        };
        self.state.send_replace(InformerState::Running);

        let drain_task = handle.spawn(drain.run(control_rx));
        let reflector_task = {
            let name = self.name.clone();
            let cancel = self.cancel.clone();
            let state = Arc::clone(&self.state);
            let queue = Arc::clone(&self.queue);
            handle.spawn(async move {
                if let Err(e) = reflector.run(cancel.clone()).await {
                    warn!(informer = %name, error = %e, "informer: failed");
                    fail(&state, &cancel, &queue, CacheError::Source(e));
                }
            })
        };
        lock(&self.tasks).extend([reflector_task, drain_task]);
        info!(informer = %self.name, resync_ms = self.config.resync_ms, indexes = ?self.store.index_names(), "informer: started");
        Ok(())
    }

    /// Cancel both tasks, close the queue and wait for the in-flight delta to finish.
    /// Returns the failure if the informer had already failed.
    pub async fn stop(&self) -> Result<(), CacheError> {
        self.cancel.cancel();
        self.queue.close();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.tasks));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(informer = %self.name, error = %e, "informer: task join failed");
            }
        }
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = InformerState::Stopped;
                true
            }
        });
        match self.state() {
            InformerState::Failed(e) => Err(e),
            _ => {
                info!(informer = %self.name, "informer: stopped");
                Ok(())
            }
        }
    }

    /// Register a handler. Objects already in the store are replayed to it as
    /// `Added` events on the drain loop before any further live event.
    pub fn add_handler(&self, handler: impl EventHandler<T> + 'static) -> HandlerId {
        self.add_shared_handler(Arc::new(handler))
    }

    pub fn add_shared_handler(&self, handler: Arc<dyn EventHandler<T>>) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        if self.control_tx.send(Control::Add(id, handler)).is_err() {
            debug!(informer = %self.name, handler = %id, "informer: handler added after drain loop ended");
        }
        id
    }

    /// Stop delivering to `id`. Events dequeued after this call are not delivered to it.
    pub fn remove_handler(&self, id: HandlerId) {
        let _ = self.control_tx.send(Control::Remove(id));
    }

    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Resolve once the first list has been fully applied and dispatched.
    /// A failed informer reports its failure even if it had synced before.
    pub async fn wait_for_sync(&self) -> Result<(), CacheError> {
        if let InformerState::Failed(e) = self.state() {
            return Err(e);
        }
        let mut synced = self.synced.subscribe();
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            r = async { synced.wait_for(|s| *s).await.map(|_| ()) } => {
                r.map_err(|_| CacheError::Stopped(self.name.clone()))
            }
            s = async { state.wait_for(|s| s.is_terminal()).await.map(|s| (*s).clone()) } => match s {
                Ok(InformerState::Failed(e)) => Err(e),
                _ => Err(CacheError::Stopped(self.name.clone())),
            },
        }
    }

    pub fn state(&self) -> InformerState { self.state.borrow().clone() }

    pub fn subscribe_state(&self) -> watch::Receiver<InformerState> { self.state.subscribe() }

    /// Last revision the reflector observed; `None` before the first list.
    pub fn last_sync_revision(&self) -> Option<Revision> {
        lock(&self.cursor).as_ref().and_then(|c| c.load_full()).map(|r| (*r).clone())
    }

    pub fn reflector_phase(&self) -> ReflectorPhase {
        lock(&self.phase).as_ref().map(|rx| *rx.borrow()).unwrap_or(ReflectorPhase::Idle)
    }

    pub fn store(&self) -> Arc<IndexedStore<T>> { Arc::clone(&self.store) }

    pub fn lister(&self) -> Lister<T> { Lister::new(Arc::clone(&self.store)) }

    pub fn add_indexer(&self, name: &str, f: IndexFunc<T>) -> Result<(), CacheError> { self.store.add_indexer(name, f) }

    pub fn config(&self) -> &InformerConfig { &self.config }
}

impl<T> Drop for SharedInformer<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}
