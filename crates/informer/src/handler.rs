//! Event handlers registered on a shared informer.

use std::fmt;

use kmirror_core::{Delta, DeltaKind, Event};

/// Callback invoked by the drain loop, after the store already reflects the event.
///
/// Returned errors (and panics) are logged and counted; they never stop
/// delivery to other handlers or to later events.
pub trait EventHandler<T>: Send + Sync {
    fn on_event(&self, event: &Event<T>) -> anyhow::Result<()>;
}

impl<T, F> EventHandler<T> for F
where
    F: Fn(&Event<T>) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &Event<T>) -> anyhow::Result<()> { self(event) }
}

type DeltaFn<T> = Box<dyn Fn(&Delta<T>) -> anyhow::Result<()> + Send + Sync>;
type SyncedFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Handler assembled from optional per-kind closures.
pub struct HandlerFns<T> {
    add: Option<DeltaFn<T>>,
    update: Option<DeltaFn<T>>,
    delete: Option<DeltaFn<T>>,
    synced: Option<SyncedFn>,
}

impl<T> Default for HandlerFns<T> {
    fn default() -> Self { Self { add: None, update: None, delete: None, synced: None } }
}

impl<T> HandlerFns<T> {
    pub fn new() -> Self { Self::default() }

    pub fn on_add(mut self, f: impl Fn(&Delta<T>) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Delta<T>) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Delta<T>) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }

    pub fn on_synced(mut self, f: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.synced = Some(Box::new(f));
        self
    }
}

impl<T> EventHandler<T> for HandlerFns<T> {
    fn on_event(&self, event: &Event<T>) -> anyhow::Result<()> {
        match event {
            Event::Synced => self.synced.as_ref().map_or(Ok(()), |f| f()),
            Event::Delta(d) => {
                let f = match d.kind {
                    DeltaKind::Added => &self.add,
                    DeltaKind::Updated => &self.update,
                    DeltaKind::Deleted => &self.delete,
                };
                f.as_ref().map_or(Ok(()), |f| f(d))
            }
        }
    }
}

/// Registration handle returned by `SharedInformer::add_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "h{}", self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmirror_core::{ObjectMeta, Resource};
    use std::sync::{Arc, Mutex};

    #[test]
    fn handler_fns_route_by_kind() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let (a, d, s) = (Arc::clone(&seen), Arc::clone(&seen), Arc::clone(&seen));
        let h: HandlerFns<()> = HandlerFns::new()
            .on_add(move |delta| {
                a.lock().unwrap().push(format!("+{}", delta.key));
                Ok(())
            })
            .on_delete(move |delta| {
                d.lock().unwrap().push(format!("-{}", delta.key));
                Ok(())
            })
            .on_synced(move || {
                s.lock().unwrap().push("synced".into());
                Ok(())
            });
        let obj = Arc::new(Resource::new(ObjectMeta::new(Some("ns"), "a", "1"), ()));
        h.on_event(&Event::Delta(Delta::added(Arc::clone(&obj)))).unwrap();
        h.on_event(&Event::Delta(Delta::updated(Arc::clone(&obj)))).unwrap();
        h.on_event(&Event::Synced).unwrap();
        h.on_event(&Event::Delta(Delta::deleted(obj))).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["+ns/a", "synced", "-ns/a"]);
    }

    #[test]
    fn closures_are_handlers() {
        fn boxed<T, H: EventHandler<T> + 'static>(h: H) -> Box<dyn EventHandler<T>> { Box::new(h) }
        let h = boxed(|ev: &Event<u8>| match ev {
            Event::Synced => Ok(()),
            Event::Delta(_) => Err(anyhow::anyhow!("boom")),
        });
        assert!(h.on_event(&Event::Synced).is_ok());
        let obj = Arc::new(Resource::new(ObjectMeta::new(None, "x", "1"), 0u8));
        assert!(h.on_event(&Event::Delta(Delta::added(obj))).is_err());
    }
}
