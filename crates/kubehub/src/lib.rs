//! Herald kubehub: a [`ResourceStore`] over the Kubernetes API.
//!
//! Objects travel as `DynamicObject` and are converted to the typed resource
//! through `serde_json`, so any `Object` whose serde form matches the custom
//! resource works without generated bindings.

#![forbid(unsafe_code)]

use std::marker::PhantomData;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use herald_core::{Object, ObjectKey, ObjectList, ResourceStore, Selector, StoreError, StoreResult, WatchEvent, WatchStream};
use kube::{
    api::{Api, ListParams, PostParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

/// Default resource served by the controller.
pub const DEFAULT_GVK: &str = "herald.dev/v1alpha1/Message";

/// Server-side watch timeout; the informer re-watches from the last seen version when it lapses.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{} (is the CRD installed?)", gvk.group, gvk.version, gvk.kind))
}

pub struct KubeStore<K> {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Object> KubeStore<K> {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced, _kind: PhantomData }
    }

    /// Connect with the ambient kubeconfig and resolve `gvk_key` through discovery.
    pub async fn connect(gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let client = Client::try_default().await.context("building kube client")?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk)
            .await
            .with_context(|| format!("resolving {}", gvk_key))?;
        if ar.kind != K::KIND {
            warn!(gvk = %gvk_key, expected = K::KIND, "resolved kind differs from the managed type");
        }
        info!(gvk = %gvk_key, plural = %ar.plural, namespaced, "kube store ready");
        Ok(Self::new(client, ar, namespaced))
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        if self.namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &self.ar)
        } else {
            Api::all_with(self.client.clone(), &self.ar)
        }
    }

    fn api_for(&self, selector: &Selector) -> Api<DynamicObject> {
        self.api(selector.namespace.as_deref().unwrap_or(""))
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Typed view of a wire object.
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> StoreResult<K> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(format!("serializing DynamicObject: {}", e)))?;
    strip_managed_fields(&mut raw);
    serde_json::from_value(raw).map_err(|e| StoreError::Invalid(format!("decoding object: {}", e)))
}

/// Wire form of a typed object, stamped with the resource's apiVersion and kind.
pub fn to_dynamic<K: Serialize>(obj: &K, ar: &ApiResource) -> StoreResult<DynamicObject> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(format!("encoding object: {}", e)))?;
    let map = raw.as_object_mut().ok_or_else(|| StoreError::Invalid("object must serialize to a map".into()))?;
    map.insert("apiVersion".into(), ar.api_version.clone().into());
    map.insert("kind".into(), ar.kind.clone().into());
    serde_json::from_value(raw).map_err(|e| StoreError::Invalid(format!("building DynamicObject: {}", e)))
}

/// Classify an API status. Key-less callers (list, watch) cannot report
/// NotFound or Conflict for a specific object, so those fall through to Internal.
pub fn map_status(resp: ErrorResponse, key: Option<&ObjectKey>) -> StoreError {
    match (resp.code, key) {
        (404, Some(k)) => StoreError::NotFound(k.clone()),
        (409, Some(k)) => StoreError::Conflict { key: k.clone(), message: resp.message },
        (410, _) => StoreError::Gone(resp.message),
        (400 | 422, _) => StoreError::Invalid(resp.message),
        (code, _) => StoreError::Internal(format!("{} ({}): {}", resp.reason, code, resp.message)),
    }
}

pub fn map_err(e: kube::Error, key: Option<&ObjectKey>) -> StoreError {
    match e {
        kube::Error::Api(resp) => map_status(resp, key),
        other => StoreError::Internal(other.to_string()),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Object + Serialize + DeserializeOwned,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        let obj = self.api(&key.namespace).get(&key.name).await.map_err(|e| map_err(e, Some(key)))?;
        from_dynamic(&obj)
    }

    async fn list(&self, selector: &Selector) -> StoreResult<ObjectList<K>> {
        let mut lp = ListParams::default();
        if let Some(labels) = selector.label_selector() {
            lp = lp.labels(&labels);
        }
        let list = self.api_for(selector).list(&lp).await.map_err(|e| map_err(e, None))?;
        let items = list.items.iter().map(from_dynamic).collect::<StoreResult<Vec<K>>>()?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(kind = K::KIND, count = items.len(), rv = %resource_version, "listed");
        Ok(ObjectList { items, resource_version })
    }

    async fn watch(&self, selector: &Selector, resource_version: &str) -> StoreResult<WatchStream<K>> {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(labels) = selector.label_selector() {
            wp = wp.labels(&labels);
        }
        let stream = self
            .api_for(selector)
            .watch(&wp, resource_version)
            .await
            .map_err(|e| map_err(e, None))?;
        debug!(kind = K::KIND, rv = %resource_version, "watch opened");
        let mapped = stream.filter_map(|ev| async move {
            match ev {
                Ok(KubeEvent::Added(o)) => Some(from_dynamic(&o).map(WatchEvent::Added)),
                Ok(KubeEvent::Modified(o)) => Some(from_dynamic(&o).map(WatchEvent::Modified)),
                Ok(KubeEvent::Deleted(o)) => Some(from_dynamic(&o).map(WatchEvent::Deleted)),
                Ok(KubeEvent::Bookmark(_)) => None,
                Ok(KubeEvent::Error(resp)) => {
                    counter!("herald_kube_watch_errors", 1u64);
                    Some(Err(map_status(resp, None)))
                }
                Err(e) => {
                    counter!("herald_kube_watch_errors", 1u64);
                    Some(Err(map_err(e, None)))
                }
            }
        });
        Ok(mapped.boxed())
    }

    async fn update(&self, obj: &K) -> StoreResult<K> {
        let key = obj.key().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let body = to_dynamic(obj, &self.ar)?;
        let stored = self
            .api(&key.namespace)
            .replace(&key.name, &PostParams::default(), &body)
            .await
            .map_err(|e| map_err(e, Some(&key)))?;
        from_dynamic(&stored)
    }

    async fn update_status(&self, obj: &K) -> StoreResult<K> {
        let key = obj.key().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let body = to_dynamic(obj, &self.ar)?;
        let data = serde_json::to_vec(&body).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let stored = self
            .api(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| map_err(e, Some(&key)))?;
        from_dynamic(&stored)
    }
}
