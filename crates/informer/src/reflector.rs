//! List-then-watch driver feeding a [`DeltaQueue`].

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use kmirror_core::{BackoffPolicy, ChangeSource, Delta, InformerConfig, Revision, SourceError, WatchEvent};
use kmirror_store::{DeltaQueue, KnownObjects};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorPhase {
    Idle,
    Listing,
    Populating,
    Watching,
}

enum WatchExit {
    /// Continuity lost. `progressed` is false when the watch yielded no event at all.
    Relist { cause: SourceError, progressed: bool },
    Stopped,
}

enum Step<T> {
    Event(WatchEvent<T>),
    Ended,
    Failed(SourceError),
    Resync,
    Cancelled,
}

pub struct Reflector<T> {
    name: String,
    source: Arc<dyn ChangeSource<T>>,
    queue: Arc<DeltaQueue<T>>,
    known: Arc<dyn KnownObjects<T>>,
    config: InformerConfig,
    cursor: Arc<ArcSwapOption<Revision>>,
    phase: Arc<watch::Sender<ReflectorPhase>>,
}

impl<T: Send + Sync + 'static> Reflector<T> {
    pub fn new(
        name: &str,
        source: Arc<dyn ChangeSource<T>>,
        queue: Arc<DeltaQueue<T>>,
        known: Arc<dyn KnownObjects<T>>,
        config: InformerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(ReflectorPhase::Idle);
        Self {
            name: name.to_string(),
            source,
            queue,
            known,
            config,
            cursor: Arc::new(ArcSwapOption::empty()),
            phase: Arc::new(phase),
        }
    }

    /// Shared handle to the resume cursor (last observed revision).
    pub fn cursor(&self) -> Arc<ArcSwapOption<Revision>> { Arc::clone(&self.cursor) }

    pub fn phase(&self) -> watch::Receiver<ReflectorPhase> { self.phase.subscribe() }

    fn set_phase(&self, p: ReflectorPhase) {
        if *self.phase.borrow() != p {
            debug!(informer = %self.name, phase = ?p, "reflector: phase");
        }
        self.phase.send_replace(p);
    }

    fn current_cursor(&self) -> Revision {
        self.cursor.load_full().map(|r| (*r).clone()).unwrap_or_default()
    }

    /// Run until cancelled or a fatal error. Closing the queue also ends the loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SourceError> {
        let res = self.run_inner(&cancel).await;
        self.set_phase(ReflectorPhase::Idle);
        if let Err(e) = &res {
            error!(informer = %self.name, error = %e, "reflector: giving up");
        }
        res
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        let mut backoff = Backoff::new(self.config.backoff);
        // Spaces out relists that made no progress; never escalates to fatal.
        let mut relist = Backoff::new(BackoffPolicy { max_retries: 0, ..self.config.backoff });
        loop {
            self.set_phase(ReflectorPhase::Listing);
            let t0 = Instant::now();
            let listed = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = self.source.snapshot() => r,
            };
            metrics::counter!("reflector_list_total", 1u64);
            let snap = match listed {
                Ok(s) => s,
                Err(e) => {
                    warn!(informer = %self.name, error = %e, "reflector: list failed");
                    if !self.pause(&mut backoff, e, cancel).await? {
                        return Ok(());
                    }
                    continue;
                }
            };
            let took_ms = t0.elapsed().as_millis();
            metrics::histogram!("reflector_list_ms", took_ms as f64);
            backoff.reset();

            self.set_phase(ReflectorPhase::Populating);
            let items = snap.items.len();
            let stats = match self.queue.replace(snap.items, &snap.revision, self.known.as_ref()) {
                Ok(s) => s,
                Err(_) => return Ok(()),
            };
            self.cursor.store(Some(Arc::new(snap.revision.clone())));
            info!(
                informer = %self.name,
                items,
                added = stats.added,
                updated = stats.updated,
                deleted = stats.deleted,
                revision = %snap.revision,
                took_ms = %took_ms,
                "reflector: list ok"
            );

            self.set_phase(ReflectorPhase::Watching);
            match self.watch(&mut backoff, cancel).await? {
                WatchExit::Relist { cause, progressed } => {
                    metrics::counter!("reflector_relist_total", 1u64);
                    if progressed {
                        relist.reset();
                    } else if !self.delay_relist(&mut relist, &cause, cancel).await {
                        return Ok(());
                    }
                }
                WatchExit::Stopped => return Ok(()),
            }
        }
    }

    async fn watch(&self, backoff: &mut Backoff, cancel: &CancellationToken) -> Result<WatchExit, SourceError> {
        let mut resync = resync_ticker(&self.config);
        let mut progressed = false;
        loop {
            let from = self.current_cursor();
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Ok(WatchExit::Stopped),
                r = self.source.watch(&from) => r,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(e) if e.is_revision_too_old() => {
                    info!(informer = %self.name, from = %from, "reflector: revision too old, relisting");
                    return Ok(WatchExit::Relist { cause: e, progressed });
                }
                Err(e) => {
                    warn!(informer = %self.name, from = %from, error = %e, "reflector: watch failed");
                    if !self.pause(backoff, e, cancel).await? {
                        return Ok(WatchExit::Stopped);
                    }
                    metrics::counter!("reflector_watch_restarts_total", 1u64);
                    continue;
                }
            };
            debug!(informer = %self.name, from = %from, "reflector: watching");

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    _ = tick(&mut resync) => Step::Resync,
                    next = stream.next() => match next {
                        Some(Ok(ev)) => Step::Event(ev),
                        Some(Err(e)) => Step::Failed(e),
                        None => Step::Ended,
                    },
                };
                match step {
                    Step::Cancelled => return Ok(WatchExit::Stopped),
                    Step::Resync => match self.queue.resync(self.known.as_ref()) {
                        Ok(queued) => {
                            metrics::counter!("reflector_resync_total", 1u64);
                            debug!(informer = %self.name, queued, "reflector: resync");
                        }
                        Err(_) => return Ok(WatchExit::Stopped),
                    },
                    Step::Event(ev) => {
                        backoff.reset();
                        progressed = true;
                        if !self.observe(ev) {
                            return Ok(WatchExit::Stopped);
                        }
                    }
                    Step::Ended => {
                        info!(informer = %self.name, cursor = %self.current_cursor(), "reflector: watch stream ended, relisting");
                        return Ok(WatchExit::Relist { cause: SourceError::transient("watch stream ended"), progressed });
                    }
                    Step::Failed(e) if e.is_revision_too_old() => {
                        info!(informer = %self.name, error = %e, "reflector: revision too old, relisting");
                        return Ok(WatchExit::Relist { cause: e, progressed });
                    }
                    Step::Failed(e) => {
                        warn!(informer = %self.name, error = %e, "reflector: watch interrupted");
                        drop(stream);
                        if !self.pause(backoff, e, cancel).await? {
                            return Ok(WatchExit::Stopped);
                        }
                        metrics::counter!("reflector_watch_restarts_total", 1u64);
                        break;
                    }
                }
            }
        }
    }

    /// Turn one stream event into a delta and advance the cursor. False once the queue is closed.
    fn observe(&self, ev: WatchEvent<T>) -> bool {
        match ev {
            WatchEvent::Bookmark(rv) => {
                self.cursor.store(Some(Arc::new(rv)));
            }
            WatchEvent::Change { kind, object, revision } => {
                let delta = Delta::new(kind, Arc::new(object)).with_revision(revision.clone());
                if self.queue.enqueue(delta).is_err() {
                    return false;
                }
                self.cursor.store(Some(Arc::new(revision)));
            }
        }
        true
    }

    /// Wait before a relist that follows a watch without progress. False when cancelled meanwhile.
    async fn delay_relist(&self, relist: &mut Backoff, cause: &SourceError, cancel: &CancellationToken) -> bool {
        let delay = relist.next_delay().unwrap_or_else(|| self.config.backoff.max_delay());
        debug!(informer = %self.name, delay_ms = %delay.as_millis(), attempt = relist.attempts(), cause = %cause, "reflector: delaying relist");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Sleep out the next backoff delay. `Ok(false)` when cancelled meanwhile;
    /// an error when the failure is fatal or retries are exhausted.
    async fn pause(&self, backoff: &mut Backoff, err: SourceError, cancel: &CancellationToken) -> Result<bool, SourceError> {
        if err.is_fatal() {
            return Err(err);
        }
        let Some(delay) = backoff.next_delay() else {
            return Err(SourceError::Fatal(format!("giving up after {} attempts: {}", backoff.attempts(), err)));
        };
        debug!(informer = %self.name, delay_ms = %delay.as_millis(), attempt = backoff.attempts(), "reflector: backing off");
        tokio::select! {
            _ = cancel.cancelled() => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }
}

fn resync_ticker(config: &InformerConfig) -> Option<Interval> {
    let period = config.resync_period()?;
    let mut iv = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(iv)
}

async fn tick(iv: &mut Option<Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
