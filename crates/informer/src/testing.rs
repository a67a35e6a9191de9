//! In-memory [`ChangeSource`] for tests and demos.
//!
//! Revisions are decimal counters. Every mutation bumps the revision, is kept
//! in a history and is pushed to open watches; a watch opened from revision
//! `n` first replays the history after `n`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use kmirror_core::{ChangeSource, ObjectKey, ObjectMeta, Resource, Revision, Snapshot, SourceError, WatchEvent, WatchStream};

type Sink<T> = mpsc::UnboundedSender<Result<WatchEvent<T>, SourceError>>;

struct FakeState<T> {
    objects: BTreeMap<ObjectKey, Resource<T>>,
    revision: u64,
    history: Vec<(u64, WatchEvent<T>)>,
    /// Watches from below this revision fail with `RevisionTooOld`.
    floor: u64,
    watchers: Vec<Sink<T>>,
    snapshot_faults: VecDeque<SourceError>,
    watch_faults: VecDeque<SourceError>,
    offline: bool,
    snapshot_calls: usize,
    watch_calls: usize,
}

impl<T: Clone> FakeState<T> {
    fn publish(&mut self, rev: u64, ev: WatchEvent<T>) {
        self.watchers.retain(|w| w.unbounded_send(Ok(ev.clone())).is_ok());
        self.history.push((rev, ev));
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

pub struct FakeSource<T> {
    state: Mutex<FakeState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for FakeSource<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Clone + Send + Sync + 'static> FakeSource<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                objects: BTreeMap::new(),
                revision: 0,
                history: Vec::new(),
                floor: 0,
                watchers: Vec::new(),
                snapshot_faults: VecDeque::new(),
                watch_faults: VecDeque::new(),
                offline: false,
                snapshot_calls: 0,
                watch_calls: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Create or replace an object; `meta.revision` is overwritten.
    pub fn put(&self, mut meta: ObjectMeta, payload: T) -> Revision {
        let mut st = self.lock();
        let rev = st.bump();
        meta.revision = Revision::new(rev.to_string());
        let obj = Resource::new(meta, payload);
        let key = obj.key();
        let ev = match st.objects.insert(key, obj.clone()) {
            Some(_) => WatchEvent::updated(obj),
            None => WatchEvent::added(obj),
        };
        st.publish(rev, ev);
        Revision::new(rev.to_string())
    }

    pub fn create(&self, namespace: Option<&str>, name: &str, payload: T) -> Revision {
        self.put(ObjectMeta::new(namespace, name, ""), payload)
    }

    /// Same as [`create`](Self::create); reported as `Updated` when the object exists.
    pub fn update(&self, namespace: Option<&str>, name: &str, payload: T) -> Revision {
        let meta = {
            let st = self.lock();
            st.objects
                .get(&ObjectKey::new(namespace, name))
                .map(|o| o.meta.clone())
                .unwrap_or_else(|| ObjectMeta::new(namespace, name, ""))
        };
        self.put(meta, payload)
    }

    /// Remove an object. `None` when it does not exist.
    pub fn delete(&self, namespace: Option<&str>, name: &str) -> Option<Revision> {
        let mut st = self.lock();
        let mut obj = st.objects.remove(&ObjectKey::new(namespace, name))?;
        let rev = st.bump();
        obj.meta.revision = Revision::new(rev.to_string());
        st.publish(rev, WatchEvent::deleted(obj));
        Some(Revision::new(rev.to_string()))
    }

    /// Send a bookmark at the current revision to open watches.
    pub fn bookmark(&self) -> Revision {
        let mut st = self.lock();
        let rv = Revision::new(st.revision.to_string());
        let ev: WatchEvent<T> = WatchEvent::Bookmark(rv.clone());
        st.watchers.retain(|w| w.unbounded_send(Ok(ev.clone())).is_ok());
        rv
    }

    /// End every open watch stream cleanly (continuity lost).
    pub fn close_watches(&self) { self.lock().watchers.clear(); }

    /// Fail every open watch stream with a transient error.
    pub fn break_watches(&self) {
        let mut st = self.lock();
        for w in st.watchers.drain(..) {
            let _ = w.unbounded_send(Err(SourceError::transient("connection reset")));
        }
    }

    /// Forget history: watches from before the current revision now fail with `RevisionTooOld`.
    pub fn compact_history(&self) {
        let mut st = self.lock();
        st.floor = st.revision;
        st.history.clear();
    }

    pub fn fail_next_snapshot(&self, err: SourceError) { self.lock().snapshot_faults.push_back(err); }

    pub fn fail_next_watch(&self, err: SourceError) { self.lock().watch_faults.push_back(err); }

    /// While offline, snapshot and watch fail transiently and open watches are broken.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
        if offline {
            self.break_watches();
        }
    }

    pub fn snapshot_calls(&self) -> usize { self.lock().snapshot_calls }

    pub fn watch_calls(&self) -> usize { self.lock().watch_calls }

    pub fn revision(&self) -> Revision { Revision::new(self.lock().revision.to_string()) }

    /// Current remote content, sorted by key.
    pub fn objects(&self) -> Vec<Resource<T>> { self.lock().objects.values().cloned().collect() }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ChangeSource<T> for FakeSource<T> {
    async fn snapshot(&self) -> Result<Snapshot<T>, SourceError> {
        let mut st = self.lock();
        st.snapshot_calls += 1;
        if st.offline {
            return Err(SourceError::transient("source offline"));
        }
        if let Some(err) = st.snapshot_faults.pop_front() {
            return Err(err);
        }
        Ok(Snapshot { items: st.objects.values().cloned().collect(), revision: Revision::new(st.revision.to_string()) })
    }

    async fn watch(&self, from: &Revision) -> Result<WatchStream<T>, SourceError> {
        let mut st = self.lock();
        st.watch_calls += 1;
        if st.offline {
            return Err(SourceError::transient("source offline"));
        }
        if let Some(err) = st.watch_faults.pop_front() {
            return Err(err);
        }
        let from_rev: u64 = from.as_str().parse().unwrap_or(0);
        if from_rev < st.floor {
            return Err(SourceError::RevisionTooOld(format!("{} < {}", from_rev, st.floor)));
        }
        let (tx, rx) = mpsc::unbounded();
        for (_, ev) in st.history.iter().filter(|(rev, _)| *rev > from_rev) {
            let _ = tx.unbounded_send(Ok(ev.clone()));
        }
        st.watchers.push(tx);
        Ok(rx.boxed())
    }
}
