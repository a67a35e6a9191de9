//! Ordered delta queue: FIFO over keys, compacting deltas per key.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kmirror_core::{CacheError, Delta, DeltaKind, ObjectKey, Resource, Revision};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

/// Read access to the objects the consumer side already holds.
pub trait KnownObjects<T>: Send + Sync {
    fn list_known(&self) -> Vec<Arc<Resource<T>>>;
}

/// Item handed to the single consumer.
#[derive(Debug)]
pub enum QueueItem<T> {
    Delta(Delta<T>),
    /// All deltas of a (re)list precede this marker.
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Appended,
    Compacted,
    /// Resync delta discarded because the key already has a pending delta.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug)]
enum Slot {
    Key(ObjectKey),
    Synced,
}

struct Pending<T> {
    /// Sync markers enqueued before this delta; deltas never compact across a marker.
    generation: u64,
    delta: Delta<T>,
}

struct QueueState<T> {
    order: VecDeque<Slot>,
    pending: FxHashMap<ObjectKey, VecDeque<Pending<T>>>,
    generation: u64,
    /// Last dequeued delta; the consumer may not have applied it yet.
    in_flight: Option<Delta<T>>,
    closed: bool,
}

impl<T> QueueState<T> {
    fn push(&mut self, delta: Delta<T>) -> Push {
        let generation = self.generation;
        match self.pending.get_mut(&delta.key) {
            Some(list) => {
                if delta.resync {
                    return Push::Dropped;
                }
                if let Some(back) = list.back_mut() {
                    if back.generation == generation {
                        back.delta = delta;
                        return Push::Compacted;
                    }
                }
                self.order.push_back(Slot::Key(delta.key.clone()));
                list.push_back(Pending { generation, delta });
                Push::Appended
            }
            None => {
                if delta.resync && self.in_flight.as_ref().map(|d| d.key == delta.key).unwrap_or(false) {
                    return Push::Dropped;
                }
                self.order.push_back(Slot::Key(delta.key.clone()));
                let mut list = VecDeque::with_capacity(1);
                let key = delta.key.clone();
                list.push_back(Pending { generation, delta });
                self.pending.insert(key, list);
                Push::Appended
            }
        }
    }

    fn push_synced(&mut self) {
        self.order.push_back(Slot::Synced);
        self.generation = self.generation.saturating_add(1);
    }

    fn pop_front(&mut self) -> Option<QueueItem<T>> {
        while let Some(slot) = self.order.pop_front() {
            match slot {
                Slot::Synced => return Some(QueueItem::Synced),
                Slot::Key(key) => {
                    let Some(list) = self.pending.get_mut(&key) else { continue };
                    let Some(p) = list.pop_front() else { continue };
                    if list.is_empty() {
                        self.pending.remove(&key);
                    }
                    self.in_flight = Some(p.delta.clone());
                    return Some(QueueItem::Delta(p.delta));
                }
            }
        }
        None
    }

    /// Newest state the consumer will hold once everything queued is applied.
    /// `None` values mark keys whose newest delta is a deletion.
    fn projected_state(&self, known: &dyn KnownObjects<T>) -> FxHashMap<ObjectKey, Option<Arc<Resource<T>>>> {
        let mut out: FxHashMap<ObjectKey, Option<Arc<Resource<T>>>> =
            known.list_known().into_iter().map(|o| (o.key(), Some(o))).collect();
        let mut overlay = |d: &Delta<T>| {
            let state = if d.kind == DeltaKind::Deleted { None } else { Some(Arc::clone(&d.object)) };
            out.insert(d.key.clone(), state);
        };
        if let Some(d) = self.in_flight.as_ref() {
            overlay(d);
        }
        for list in self.pending.values() {
            if let Some(p) = list.back() {
                overlay(&p.delta);
            }
        }
        out
    }

    fn depth(&self) -> usize { self.order.len() }
}

/// Compacting FIFO of pending deltas with exactly one consumer.
///
/// Distinct keys are dequeued in the order they were first enqueued. Two
/// deltas for the same key that meet in the queue collapse into the later one,
/// unless a sync marker separates them. A resync delta never replaces a
/// pending delta for its key.
pub struct DeltaQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> Default for DeltaQueue<T> {
    fn default() -> Self { Self::new() }
}

impl<T> DeltaQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                pending: FxHashMap::default(),
                generation: 0,
                in_flight: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never blocks. Fails only once the queue is closed.
    pub fn enqueue(&self, delta: Delta<T>) -> Result<Push, CacheError> {
        let mut st = self.lock();
        if st.closed {
            return Err(CacheError::QueueClosed);
        }
        let outcome = st.push(delta);
        metrics::gauge!("queue_depth", st.depth() as f64);
        drop(st);
        match outcome {
            Push::Appended => self.notify.notify_one(),
            Push::Compacted => metrics::counter!("queue_compacted_total", 1u64),
            Push::Dropped => {}
        }
        Ok(outcome)
    }

    pub fn enqueue_synced(&self) -> Result<(), CacheError> {
        let mut st = self.lock();
        if st.closed {
            return Err(CacheError::QueueClosed);
        }
        st.push_synced();
        drop(st);
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueue a full listing atomically: one delta per listed object (Added
    /// when the key is not known locally, Updated otherwise), a tombstone
    /// Deleted for every locally known key missing from the listing, then the
    /// sync marker.
    pub fn replace(
        &self,
        items: Vec<Resource<T>>,
        revision: &Revision,
        known: &dyn KnownObjects<T>,
    ) -> Result<ReplaceStats, CacheError> {
        let mut st = self.lock();
        if st.closed {
            return Err(CacheError::QueueClosed);
        }
        let mut projected = st.projected_state(known);
        let mut stats = ReplaceStats::default();
        let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
        for obj in items {
            let obj = Arc::new(obj);
            let key = obj.key();
            let exists = matches!(projected.get(&key), Some(Some(_)));
            let kind = if exists { DeltaKind::Updated } else { DeltaKind::Added };
            if exists { stats.updated += 1 } else { stats.added += 1 }
            listed.insert(key);
            st.push(Delta::new(kind, obj));
        }
        let mut stale: Vec<(ObjectKey, Arc<Resource<T>>)> = projected
            .drain()
            .filter(|(k, _)| !listed.contains(k))
            .filter_map(|(k, v)| v.map(|o| (k, o)))
            .collect();
        stale.sort_by(|a, b| a.0.cmp(&b.0));
        for (_key, obj) in stale {
            stats.deleted += 1;
            st.push(Delta::deleted(obj).with_revision(revision.clone()).into_tombstone());
        }
        st.push_synced();
        metrics::gauge!("queue_depth", st.depth() as f64);
        drop(st);
        debug!(added = stats.added, updated = stats.updated, deleted = stats.deleted, "queue: replace");
        self.notify.notify_one();
        Ok(stats)
    }

    /// Re-deliver every known object as a resync Updated. Returns how many were queued.
    pub fn resync(&self, known: &dyn KnownObjects<T>) -> Result<usize, CacheError> {
        // Lock order: queue, then store.
        let mut st = self.lock();
        if st.closed {
            return Err(CacheError::QueueClosed);
        }
        let objects = known.list_known();
        let mut queued = 0usize;
        for obj in objects {
            if st.push(Delta::updated(obj).into_resync()) != Push::Dropped {
                queued += 1;
            }
        }
        drop(st);
        if queued > 0 {
            self.notify.notify_one();
        }
        Ok(queued)
    }

    pub fn try_dequeue(&self) -> Option<QueueItem<T>> {
        let mut st = self.lock();
        if st.closed {
            return None;
        }
        let item = st.pop_front();
        metrics::gauge!("queue_depth", st.depth() as f64);
        item
    }

    /// Wait for the next item. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<QueueItem<T>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if st.closed {
                    return None;
                }
                if let Some(item) = st.pop_front() {
                    metrics::gauge!("queue_depth", st.depth() as f64);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark the last dequeued delta as applied.
    pub fn done(&self) {
        self.lock().in_flight = None;
    }

    /// Reject further enqueues, drop pending items and wake the consumer.
    pub fn close(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.order.clear();
        st.pending.clear();
        st.in_flight = None;
        drop(st);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool { self.lock().closed }

    /// Number of queued items (keys plus sync markers).
    pub fn len(&self) -> usize { self.lock().depth() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn pending_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.lock().pending.keys().cloned().collect();
        keys.sort();
        keys
    }
}
