use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kmirror_core::{ChangeSource, DeltaKind, Revision, Snapshot, SourceError, WatchEvent, WatchStream};
use kube::api::{Api, ListParams, WatchParams};
use kube::core::WatchEvent as KubeEvent;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{classify, classify_status, to_resource};

const DEFAULT_PAGE_SIZE: u32 = 500;
const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

/// List+watch over an [`Api`], typed or dynamic.
///
/// Server-side watch timeouts are resumed inside the stream from the last
/// seen resourceVersion; the stream only ends with an error.
pub struct KubeSource<K> {
    api: Api<K>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    page_size: u32,
    watch_timeout_secs: u32,
}

impl<K> KubeSource<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            label_selector: None,
            field_selector: None,
            page_size: DEFAULT_PAGE_SIZE,
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
        }
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn page_size(mut self, limit: u32) -> Self {
        self.page_size = limit.max(1);
        self
    }

    /// Server-side watch timeout; the apiserver caps it below 295s.
    pub fn watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, DEFAULT_WATCH_TIMEOUT_SECS);
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default().limit(self.page_size);
        if let Some(l) = &self.label_selector {
            lp = lp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            lp = lp.fields(f);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(self.watch_timeout_secs);
        if let Some(l) = &self.label_selector {
            wp = wp.labels(l);
        }
        if let Some(f) = &self.field_selector {
            wp = wp.fields(f);
        }
        wp
    }
}

struct Resume<K> {
    api: Api<K>,
    params: WatchParams,
    rv: String,
    inner: Option<BoxStream<'static, kube::Result<KubeEvent<K>>>>,
}

fn convert<K: kube::Resource>(ev: KubeEvent<K>) -> Result<Option<WatchEvent<K>>, SourceError> {
    let change = |kind: DeltaKind, obj: K| to_resource(obj).map(|r| WatchEvent::change(kind, r));
    match ev {
        KubeEvent::Added(o) => Ok(change(DeltaKind::Added, o)),
        KubeEvent::Modified(o) => Ok(change(DeltaKind::Updated, o)),
        KubeEvent::Deleted(o) => Ok(change(DeltaKind::Deleted, o)),
        KubeEvent::Bookmark(b) => Ok(Some(WatchEvent::Bookmark(Revision::new(b.metadata.resource_version)))),
        KubeEvent::Error(resp) => Err(classify_status(resp.code, &resp.message)),
    }
}

#[async_trait]
impl<K> ChangeSource<K> for KubeSource<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn snapshot(&self) -> Result<Snapshot<K>, SourceError> {
        let t0 = std::time::Instant::now();
        let mut items = Vec::new();
        let mut revision = String::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let mut lp = self.list_params();
            if let Some(t) = &token {
                lp = lp.continue_token(t);
            }
            let page = self.api.list(&lp).await.map_err(|e| classify(&e))?;
            pages += 1;
            // every page is consistent with the first one
            if revision.is_empty() {
                revision = page.metadata.resource_version.clone().unwrap_or_default();
            }
            items.extend(page.items.into_iter().filter_map(to_resource));
            match page.metadata.continue_ {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => break,
            }
        }
        info!(items = items.len(), pages, rv = %revision, took_ms = %t0.elapsed().as_millis(), "kubehub: list ok");
        Ok(Snapshot { items, revision: Revision::new(revision) })
    }

    async fn watch(&self, from: &Revision) -> Result<WatchStream<K>, SourceError> {
        let params = self.watch_params();
        let first = self.api.watch(&params, from.as_str()).await.map_err(|e| classify(&e))?;
        let state = Resume { api: self.api.clone(), params, rv: from.to_string(), inner: Some(first.boxed()) };
        let stream = futures::stream::unfold(Some(state), |state| async move {
            let mut st = state?;
            loop {
                if st.inner.is_none() {
                    match st.api.watch(&st.params, &st.rv).await {
                        Ok(s) => {
                            metrics::counter!("kube_watch_resumed_total", 1u64);
                            debug!(rv = %st.rv, "kubehub: watch resumed after server timeout");
                            st.inner = Some(s.boxed());
                        }
                        Err(e) => return Some((Err(classify(&e)), None)),
                    }
                }
                let next = match st.inner.as_mut() {
                    Some(s) => s.next().await,
                    None => continue,
                };
                match next {
                    None => st.inner = None,
                    Some(Err(e)) => return Some((Err(classify(&e)), None)),
                    Some(Ok(ev)) => match convert(ev) {
                        Ok(Some(out)) => {
                            st.rv = out.revision().to_string();
                            return Some((Ok(out), Some(st)));
                        }
                        Ok(None) => {}
                        Err(err) => return Some((Err(err), None)),
                    },
                }
            }
        });
        Ok(stream.boxed())
    }
}
