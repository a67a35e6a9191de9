#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kmirror_core::{BackoffPolicy, CacheError, DeltaKind, Event, InformerConfig, ObjectMeta, Resource, Revision, SourceError};
use kmirror_informer::testing::FakeSource;
use kmirror_informer::{EventHandler, HandlerFns, InformerState, ReflectorPhase, SharedInformer};
use kmirror_store::IndexFunc;

fn fast_config() -> InformerConfig {
    InformerConfig::default().with_backoff(BackoffPolicy { base_delay_ms: 5, max_delay_ms: 50, max_retries: 0 })
}

#[derive(Default, Clone)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn events(&self) -> Vec<String> { self.0.lock().unwrap().clone() }
    fn len(&self) -> usize { self.0.lock().unwrap().len() }
    fn contains(&self, line: &str) -> bool { self.0.lock().unwrap().iter().any(|l| l == line) }
}

impl EventHandler<String> for Recorder {
    fn on_event(&self, event: &Event<String>) -> anyhow::Result<()> {
        let line = match event {
            Event::Synced => "synced".to_string(),
            Event::Delta(d) => format!("{} {} {}", d.kind.as_str(), d.key, d.object.payload),
        };
        self.0.lock().unwrap().push(line);
        Ok(())
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn informer(name: &str, src: &Arc<FakeSource<String>>, config: InformerConfig) -> SharedInformer<String> {
    SharedInformer::new(name, src.clone(), config)
}

fn payloads(inf: &SharedInformer<String>) -> Vec<String> {
    inf.lister().list_all().iter().map(|o| format!("{}={}", o.key(), o.payload)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_then_watch_delivers_in_order() {
    let src = Arc::new(FakeSource::new());
    src.create(Some("ns"), "a", "a-v1".to_string());
    src.create(Some("ns"), "b", "b-v1".to_string());

    let inf = informer("widgets", &src, fast_config());
    let rec = Recorder::default();
    inf.add_handler(rec.clone());
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();
    assert!(inf.has_synced());

    src.update(Some("ns"), "a", "a-v2".into());
    src.delete(Some("ns"), "b");
    src.create(Some("ns"), "c", "c-v1".into());
    wait_until("six events", || rec.len() == 6).await;

    let events = rec.events();
    let mut initial = events[..2].to_vec();
    initial.sort();
    assert_eq!(initial, vec!["added ns/a a-v1", "added ns/b b-v1"]);
    assert_eq!(&events[2..], &["synced", "updated ns/a a-v2", "deleted ns/b b-v1", "added ns/c c-v1"]);
    assert_eq!(payloads(&inf), vec!["ns/a=a-v2", "ns/c=c-v1"]);
    wait_until("cursor", || inf.last_sync_revision() == Some(Revision::from("5"))).await;
    assert_eq!(inf.reflector_phase(), ReflectorPhase::Watching);

    inf.stop().await.unwrap();
    assert_eq!(inf.state(), InformerState::Stopped);
    assert_eq!(inf.reflector_phase(), ReflectorPhase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_reflects_delta_before_handlers_run() {
    let src = Arc::new(FakeSource::new());
    for i in 0..5 {
        src.create(Some("ns"), &format!("o{}", i), "v0".to_string());
    }
    let inf = informer("widgets", &src, fast_config());
    let lister = inf.lister();
    let seen = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    {
        let (seen, violations) = (Arc::clone(&seen), Arc::clone(&violations));
        inf.add_handler(move |ev: &Event<String>| -> anyhow::Result<()> {
            if let Event::Delta(d) = ev {
                seen.fetch_add(1, Ordering::SeqCst);
                let current = lister.get_by_key(d.key.as_str());
                let ok = match d.kind {
                    DeltaKind::Deleted => current.is_none(),
                    _ => current.map(|o| o.meta.revision == d.object.meta.revision).unwrap_or(false),
                };
                if !ok {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(())
        });
    }
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();
    for round in 1..=10 {
        for i in 0..5 {
            src.update(Some("ns"), &format!("o{}", i), format!("v{}", round));
        }
    }
    src.delete(Some("ns"), "o0");
    wait_until("final state", || inf.lister().get(Some("ns"), "o0").is_none()).await;
    wait_until("last update", || {
        inf.lister().get(Some("ns"), "o4").map(|o| o.payload == "v10").unwrap_or(false)
    })
    .await;

    assert!(seen.load(Ordering::SeqCst) >= 6);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_handler_gets_store_replay_before_live_events() {
    let src = Arc::new(FakeSource::new());
    let mut expected = Vec::new();
    for i in 0..10 {
        src.create(Some("ns"), &format!("o{}", i), format!("p{}", i));
        expected.push(format!("added ns/o{} p{}", i, i));
    }
    let inf = informer("widgets", &src, fast_config());
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();

    let late = Recorder::default();
    inf.add_handler(late.clone());
    src.create(Some("ns"), "live", "live".to_string());
    wait_until("replay plus live event", || late.len() == 11).await;

    let events = late.events();
    let mut replayed = events[..10].to_vec();
    replayed.sort();
    expected.sort();
    assert_eq!(replayed, expected);
    assert_eq!(events[10], "added ns/live live");
    assert!(!late.contains("synced"));
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_break_resumes_without_relist() {
    let src = Arc::new(FakeSource::new());
    src.create(Some("ns"), "a", "a".to_string());
    let inf = informer("widgets", &src, fast_config());
    let rec = Recorder::default();
    inf.add_handler(rec.clone());
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();
    wait_until("watch open", || src.watch_calls() == 1).await;

    src.break_watches();
    src.create(Some("ns"), "b", "b".to_string());
    wait_until("b observed", || rec.contains("added ns/b b")).await;

    assert_eq!(src.snapshot_calls(), 1);
    assert!(src.watch_calls() >= 2);
    assert_eq!(payloads(&inf), vec!["ns/a=a", "ns/b=b"]);
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_history_relists_and_converges() {
    let src = Arc::new(FakeSource::new());
    for n in ["a", "b", "c"] {
        src.create(Some("ns"), n, format!("{}-v1", n));
    }
    let inf = informer("widgets", &src, fast_config());
    let rec = Recorder::default();
    let tombstones = Arc::new(Mutex::new(Vec::<String>::new()));
    inf.add_handler(rec.clone());
    {
        let tombstones = Arc::clone(&tombstones);
        inf.add_handler(HandlerFns::new().on_delete(move |d| {
            if d.tombstone {
                tombstones.lock().unwrap().push(d.key.to_string());
            }
            Ok(())
        }));
    }
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();
    wait_until("watch open", || src.watch_calls() == 1).await;

    src.set_offline(true);
    src.update(Some("ns"), "a", "a-v2".into());
    src.delete(Some("ns"), "b");
    src.create(Some("ns"), "d", "d-v1".into());
    src.compact_history();
    src.set_offline(false);

    wait_until("second sync", || rec.events().iter().filter(|l| *l == "synced").count() == 2).await;
    let want: Vec<String> = src.objects().iter().map(|o| format!("{}={}", o.key(), o.payload)).collect();
    assert_eq!(payloads(&inf), want);
    assert_eq!(want, vec!["ns/a=a-v2", "ns/c=c-v1", "ns/d=d-v1"]);
    assert_eq!(*tombstones.lock().unwrap(), vec!["ns/b"]);
    assert!(rec.contains("updated ns/a a-v2"));
    assert!(rec.contains("added ns/d d-v1"));
    assert!(src.snapshot_calls() >= 2);
    inf.store().verify().unwrap();
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_end_triggers_relist() {
    let src = Arc::new(FakeSource::new());
    src.create(None, "node-1", "n1".to_string());
    let inf = informer("nodes", &src, fast_config());
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();
    wait_until("watch open", || src.watch_calls() == 1).await;

    src.close_watches();
    wait_until("relist", || src.snapshot_calls() == 2).await;
    wait_until("rewatch", || src.watch_calls() == 2).await;
    assert!(inf.has_synced());
    assert_eq!(payloads(&inf), vec!["node-1=n1"]);
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_list_failures_are_retried() {
    let src = Arc::new(FakeSource::new());
    src.create(Some("ns"), "a", "a".to_string());
    src.fail_next_snapshot(SourceError::transient("timeout"));
    src.fail_next_snapshot(SourceError::transient("timeout"));
    let inf = informer("widgets", &src, fast_config());
    inf.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), inf.wait_for_sync()).await.unwrap().unwrap();
    assert_eq!(src.snapshot_calls(), 3);
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_source_error_fails_the_informer() {
    let src: Arc<FakeSource<String>> = Arc::new(FakeSource::new());
    src.fail_next_snapshot(SourceError::fatal("forbidden"));
    let inf = informer("secrets", &src, fast_config());
    inf.start().unwrap();

    let err = inf.wait_for_sync().await.unwrap_err();
    assert_eq!(err, CacheError::Source(SourceError::Fatal("forbidden".into())));
    assert_eq!(inf.state(), InformerState::Failed(err.clone()));
    assert_eq!(inf.stop().await.unwrap_err(), err);
    assert_eq!(src.snapshot_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_become_fatal() {
    let src: Arc<FakeSource<String>> = Arc::new(FakeSource::new());
    src.set_offline(true);
    let cfg = InformerConfig::default().with_backoff(BackoffPolicy { base_delay_ms: 1, max_delay_ms: 5, max_retries: 2 });
    let inf = informer("widgets", &src, cfg);
    inf.start().unwrap();

    match inf.wait_for_sync().await {
        Err(CacheError::Source(SourceError::Fatal(msg))) => assert!(msg.contains("giving up"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(src.snapshot_calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handlers_are_isolated() {
    let src = Arc::new(FakeSource::new());
    src.create(Some("ns"), "a", "a".to_string());
    let inf = informer("widgets", &src, fast_config());
    inf.add_handler(HandlerFns::<String>::new().on_add(|_| panic!("handler bug")));
    inf.add_handler(|_: &Event<String>| -> anyhow::Result<()> { Err(anyhow::anyhow!("always fails")) });
    let rec = Recorder::default();
    inf.add_handler(rec.clone());
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();

    src.create(Some("ns"), "b", "b".to_string());
    wait_until("b delivered", || rec.contains("added ns/b b")).await;
    assert_eq!(rec.events()[..2], ["added ns/a a", "synced"]);
    assert_eq!(inf.state(), InformerState::Running);
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_handler_stops_receiving() {
    let src = Arc::new(FakeSource::new());
    let inf = informer("widgets", &src, fast_config());
    let removed = Recorder::default();
    let kept = Recorder::default();
    let id = inf.add_handler(removed.clone());
    inf.add_handler(kept.clone());
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();

    src.create(Some("ns"), "x", "x".to_string());
    wait_until("x delivered", || kept.contains("added ns/x x")).await;
    inf.remove_handler(id);
    src.create(Some("ns"), "y", "y".to_string());
    wait_until("y delivered", || kept.contains("added ns/y y")).await;

    assert!(removed.contains("added ns/x x"));
    assert!(!removed.contains("added ns/y y"));
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_redelivers_without_contacting_source() {
    let src = Arc::new(FakeSource::new());
    src.put(ObjectMeta::new(Some("ns"), "a", "").with_label("app", "web"), "a".to_string());
    let cfg = fast_config().with_resync(Duration::from_millis(20));
    let inf = informer("widgets", &src, cfg);
    let resyncs = Arc::new(AtomicUsize::new(0));
    {
        let resyncs = Arc::clone(&resyncs);
        inf.add_handler(HandlerFns::new().on_update(move |d| {
            if d.resync {
                resyncs.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));
    }
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();

    wait_until("two resyncs", || resyncs.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(src.snapshot_calls(), 1);
    assert_eq!(payloads(&inf), vec!["ns/a=a"]);
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_twice_is_rejected() {
    let src: Arc<FakeSource<String>> = Arc::new(FakeSource::new());
    let inf = informer("widgets", &src, fast_config());
    inf.start().unwrap();
    assert_eq!(inf.start().unwrap_err(), CacheError::AlreadyStarted("widgets".into()));
    inf.stop().await.unwrap();
    assert_eq!(inf.state(), InformerState::Stopped);
    assert_eq!(inf.start().unwrap_err(), CacheError::AlreadyStarted("widgets".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_for_sync_fails_when_stopped_before_sync() {
    let src: Arc<FakeSource<String>> = Arc::new(FakeSource::new());
    src.set_offline(true);
    let inf = informer("widgets", &src, fast_config());
    inf.start().unwrap();
    inf.stop().await.unwrap();
    assert_eq!(inf.wait_for_sync().await.unwrap_err(), CacheError::Stopped("widgets".into()));
    assert!(!inf.has_synced());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_expired_watches_space_out_relists() {
    let src = Arc::new(FakeSource::new());
    src.create(Some("default"), "a", "v1".to_string());
    for _ in 0..5 {
        src.fail_next_watch(SourceError::RevisionTooOld("expired".into()));
    }
    let cfg = InformerConfig::default().with_backoff(BackoffPolicy { base_delay_ms: 20, max_delay_ms: 50, max_retries: 0 });
    let inf = informer("widgets", &src, cfg);
    let t0 = std::time::Instant::now();
    inf.start().unwrap();

    wait_until("sixth list", || src.snapshot_calls() >= 6).await;
    // 20 + 40 + 50 + 50 + 50 ms between the six lists
    assert!(t0.elapsed() >= Duration::from_millis(200), "relisted too fast: {:?}", t0.elapsed());
    assert_eq!(inf.state(), InformerState::Running);

    // a watch that delivers again resets the relist delay
    src.update(Some("default"), "a", "v2".to_string());
    wait_until("update applied", || payloads(&inf) == vec!["default/a=v2"]).await;
    inf.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unstable_index_function_fails_the_informer() {
    let src = Arc::new(FakeSource::new());
    src.create(Some("default"), "a", "v1".to_string());
    let inf = informer("widgets", &src, fast_config());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let generation: IndexFunc<String> =
        Arc::new(move |_: &Resource<String>| vec![counter.fetch_add(1, Ordering::SeqCst).to_string()]);
    inf.add_indexer("generation", generation).unwrap();
    inf.start().unwrap();
    inf.wait_for_sync().await.unwrap();

    src.update(Some("default"), "a", "v2".to_string());
    wait_until("informer failed", || inf.state().is_terminal()).await;
    assert!(matches!(inf.state(), InformerState::Failed(CacheError::IndexDrift(_))), "{:?}", inf.state());
    assert!(calls.load(Ordering::SeqCst) >= 2);

    let err = inf.wait_for_sync().await.unwrap_err();
    assert!(matches!(err, CacheError::IndexDrift(_)));
    assert_eq!(inf.stop().await, Err(err));
}
