//! kmirror kubehub: API discovery and the Kubernetes change source.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use kmirror_core::{ObjectMeta, Resource, SourceError, Uid};
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use uuid::Uuid;

mod source;

pub use source::KubeSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let t0 = std::time::Instant::now();
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    info!(count = out.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: discover ok");
    Ok(out)
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Dynamic API handle for a GVK key. Cluster-scoped kinds ignore `namespace`.
/// The flag reports whether the kind is namespaced.
pub async fn api_for_gvk(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<(Api<DynamicObject>, bool)> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api = match namespace {
        Some(ns) if namespaced => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    Ok((api, namespaced))
}

/// Change source over dynamic objects of one GVK.
pub async fn dynamic_source(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<KubeSource<DynamicObject>> {
    let (api, namespaced) = api_for_gvk(client, gvk_key, namespace).await?;
    info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kubehub: source ready");
    Ok(KubeSource::new(api))
}

fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields<K: kube::Resource>(obj: &mut K) { obj.meta_mut().managed_fields = None; }

#[cfg(not(feature = "strip-managed-fields"))]
fn strip_managed_fields<K: kube::Resource>(_obj: &mut K) {}

/// Wrap a Kubernetes object for the cache. `None` when it carries no name.
pub fn to_resource<K: kube::Resource>(obj: K) -> Option<Resource<K>> {
    let mut obj = obj;
    strip_managed_fields(&mut obj);
    let meta = {
        let m = obj.meta();
        let name = m.name.as_deref()?;
        let mut meta = ObjectMeta::new(m.namespace.as_deref(), name, m.resource_version.clone().unwrap_or_default());
        meta.uid = m.uid.as_deref().and_then(|u| to_uid(u).ok());
        meta.creation_ts = m.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0);
        if let Some(labels) = &m.labels {
            meta.labels = labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
        if let Some(annotations) = &m.annotations {
            meta.annotations = annotations.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
        meta
    };
    Some(Resource::new(meta, obj))
}

/// Map a kube client error onto the source error taxonomy.
pub fn classify(err: &kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code, &resp.message),
        kube::Error::Auth(e) => SourceError::fatal(e),
        kube::Error::InferConfig(e) => SourceError::fatal(e),
        other => SourceError::transient(other),
    }
}

/// 410 Gone means the requested revision was compacted away; auth and
/// missing-resource statuses are not retried.
pub fn classify_status(code: u16, message: &str) -> SourceError {
    match code {
        410 => SourceError::RevisionTooOld(message.to_string()),
        401 | 403 | 404 => SourceError::Fatal(format!("{}: {}", code, message)),
        _ => SourceError::Transient(format!("{}: {}", code, message)),
    }
}
