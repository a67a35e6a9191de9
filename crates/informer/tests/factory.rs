#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kmirror_core::{CacheError, ChangeSource, InformerConfig, SourceError};
use kmirror_informer::testing::FakeSource;
use kmirror_informer::{InformerFactory, InformerState, SharedInformer};

fn fake<T: Clone + Send + Sync + 'static>() -> Arc<dyn ChangeSource<T>> { Arc::new(FakeSource::<T>::new()) }

#[test]
fn one_informer_per_kind_under_concurrent_first_access() {
    let factory = InformerFactory::default();
    let built = AtomicUsize::new(0);
    let informers: Vec<Arc<SharedInformer<String>>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let (inf, _lister) = factory
                        .for_resource("widgets", || {
                            built.fetch_add(1, Ordering::SeqCst);
                            fake::<String>()
                        })
                        .unwrap();
                    inf
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(informers.iter().all(|i| Arc::ptr_eq(i, &informers[0])));
    assert_eq!(factory.kinds(), vec!["widgets"]);
}

#[test]
fn same_kind_with_other_payload_type_is_rejected() {
    let factory = InformerFactory::default();
    factory.for_resource::<String, _>("widgets", fake::<String>).unwrap();
    let err = factory.for_resource::<u32, _>("widgets", fake::<u32>).err().unwrap();
    assert_eq!(err, CacheError::TypeMismatch("widgets".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_all_sync_and_shutdown() {
    let factory = InformerFactory::default();
    let pods = Arc::new(FakeSource::new());
    pods.create(Some("default"), "web-0", "pod".to_string());
    let nodes = Arc::new(FakeSource::new());
    nodes.create(None, "node-1", 1u32);

    let (pod_informer, pod_lister) = {
        let pods: Arc<dyn ChangeSource<String>> = pods.clone();
        factory.for_resource::<String, _>("v1/Pod", move || pods).unwrap()
    };
    let (node_informer, node_lister) = {
        let nodes: Arc<dyn ChangeSource<u32>> = nodes.clone();
        factory.for_resource::<u32, _>("v1/Node", move || nodes).unwrap()
    };
    factory.start_all().unwrap();

    // registered after start_all: starts right away
    let cms = Arc::new(FakeSource::new());
    cms.create(Some("default"), "cfg", "data".to_string());
    let (_, cm_lister) = {
        let cms: Arc<dyn ChangeSource<String>> = cms.clone();
        factory.for_resource::<String, _>("v1/ConfigMap", move || cms).unwrap()
    };

    factory.wait_for_cache_sync().await.unwrap();
    assert_eq!(pod_lister.list("default").len(), 1);
    assert_eq!(node_lister.get(None, "node-1").map(|o| o.payload), Some(1));
    assert_eq!(cm_lister.get(Some("default"), "cfg").map(|o| o.payload.clone()), Some("data".to_string()));
    assert_eq!(factory.kinds(), vec!["v1/ConfigMap", "v1/Node", "v1/Pod"]);

    factory.shutdown().await.unwrap();
    assert_eq!(pod_informer.state(), InformerState::Stopped);
    assert_eq!(node_informer.state(), InformerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_sync_reports_failed_informer() {
    let factory = InformerFactory::default();
    let secrets: Arc<FakeSource<String>> = Arc::new(FakeSource::new());
    secrets.fail_next_snapshot(SourceError::fatal("forbidden"));
    {
        let secrets: Arc<dyn ChangeSource<String>> = secrets.clone();
        factory.for_resource::<String, _>("v1/Secret", move || secrets).unwrap();
    }
    factory.start_all().unwrap();
    let err = factory.wait_for_cache_sync().await.unwrap_err();
    assert_eq!(err, CacheError::Source(SourceError::Fatal("forbidden".into())));
    assert!(factory.shutdown().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_registration_from_plain_thread_uses_factory_runtime() {
    let factory = InformerFactory::default();
    factory.start_all().unwrap();

    let jobs = Arc::new(FakeSource::new());
    jobs.create(Some("batch"), "nightly", "job".to_string());
    let lister = std::thread::scope(|s| {
        s.spawn(|| {
            let jobs: Arc<dyn ChangeSource<String>> = jobs.clone();
            factory.for_resource::<String, _>("batch/v1/Job", move || jobs).map(|(_, l)| l)
        })
        .join()
        .unwrap()
    })
    .unwrap();

    factory.wait_for_cache_sync().await.unwrap();
    assert_eq!(lister.list("batch").len(), 1);
    factory.shutdown().await.unwrap();
}

#[test]
fn start_all_outside_runtime_is_an_error() {
    let factory = InformerFactory::default();
    assert_eq!(factory.start_all(), Err(CacheError::NoRuntime("factory".into())));
}

#[test]
fn per_kind_config_overrides_factory_default() {
    let factory = InformerFactory::new(InformerConfig { resync_ms: 30_000, ..InformerConfig::default() });
    let quiet = InformerConfig { resync_ms: 0, namespace_index: false, ..InformerConfig::default() };
    let (leases, _) = factory.for_resource_with::<String, _>("coordination/v1/Lease", quiet, fake::<String>).unwrap();
    let (pods, _) = factory.for_resource::<String, _>("v1/Pod", fake::<String>).unwrap();
    assert_eq!(leases.config().resync_ms, 0);
    assert!(!leases.config().namespace_index);
    assert_eq!(pods.config().resync_ms, 30_000);

    // an existing kind keeps the config it was built with
    let again = InformerConfig { resync_ms: 5, ..InformerConfig::default() };
    let (same, _) = factory.for_resource_with::<String, _>("coordination/v1/Lease", again, fake::<String>).unwrap();
    assert!(Arc::ptr_eq(&same, &leases));
    assert_eq!(same.config().resync_ms, 0);
}
