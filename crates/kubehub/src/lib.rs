//! secmeta kubehub: kube-rs backed resource stores.
//!
//! [`KubeStore`] adapts any kube resource to the [`ResourceStore`] seam by
//! converting each object on the way in. Pods and OpenShift images convert into
//! [`WatchedResource`]; custom resources can be stored as themselves.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, WatchParams},
    core::WatchEvent as KubeWatchEvent,
    Client, Resource,
};
use metrics::counter;
use secmeta_core::{Labels, ResourceKey, WatchedResource};
use secmeta_store::{Listing, MetadataPatcher, ResourceStore, Result, StoreError, WatchEvent, WatchStream};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

pub mod images;
pub mod pipelines;
pub mod pods;

pub use images::{image_store, watched_from_image, OPENSHIFT_IMAGE_GVK};
pub use pipelines::pipeline_store;
pub use pods::{pod_store, watched_from_pod};

/// Server-side watch timeout; the stream is reopened from a fresh list afterwards.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub async fn get_kube_client() -> AnyResult<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster environment")
}

/// Map a kube error onto the store taxonomy: 404 is terminal, 410 asks for a relist.
pub fn store_error(what: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 410 => StoreError::Gone(ae.message),
        kube::Error::SerdeError(e) => StoreError::Decode(format!("{what}: {e}")),
        other => StoreError::Api(format!("{what}: {other}")),
    }
}

/// Builds an `Api` for one namespace, or for every namespace (or cluster scope) with `None`.
pub type ApiFactory<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// Converts a kube object into the cached type; errors skip the object.
pub type Convert<K, T> = fn(K) -> Result<T>;

pub struct KubeStore<K, T> {
    what: &'static str,
    namespace: Option<String>,
    api_for: ApiFactory<K>,
    convert: Convert<K, T>,
}

impl<K, T> KubeStore<K, T>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// `namespace` restricts list/watch; point reads and patches follow the key's namespace.
    pub fn new(what: &'static str, namespace: Option<String>, api_for: ApiFactory<K>, convert: Convert<K, T>) -> Self {
        Self { what, namespace, api_for, convert }
    }

    fn collection(&self) -> Api<K> { (self.api_for)(self.namespace.as_deref()) }

    fn object(&self, key: &ResourceKey) -> Api<K> { (self.api_for)(key.namespace()) }

    fn convert_or_skip(what: &'static str, convert: Convert<K, T>, obj: K) -> Option<T> {
        let name = obj.meta().name.clone().unwrap_or_default();
        match convert(obj) {
            Ok(t) => Some(t),
            Err(e) => {
                counter!("secmeta_decode_skipped_total", 1u64, "kind" => what);
                warn!(kind = what, name = %name, error = %e, "skipping object that does not convert");
                None
            }
        }
    }
}

/// Identity conversion for resources cached as themselves.
pub fn as_is<K>(obj: K) -> Result<K> { Ok(obj) }

#[async_trait::async_trait]
impl<K, T> ResourceStore<T> for KubeStore<K, T>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<T>> {
        let list = self.collection().list(&ListParams::default()).await.map_err(|e| store_error(self.what, e))?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let total = list.items.len();
        let items: Vec<T> = list.items.into_iter().filter_map(|o| Self::convert_or_skip(self.what, self.convert, o)).collect();
        debug!(kind = self.what, ns = ?self.namespace, total, kept = items.len(), rv = %resource_version, "listed");
        Ok(Listing { items, resource_version })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<T>> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.collection().watch(&wp, resource_version).await.map_err(|e| store_error(self.what, e))?;
        info!(kind = self.what, ns = ?self.namespace, rv = %resource_version, "watch opened");
        let what = self.what;
        let convert = self.convert;
        let mapped = stream
            .map_err(move |e| store_error(what, e))
            .filter_map(move |ev| async move {
                match ev {
                    Ok(KubeWatchEvent::Added(o)) => Self::convert_or_skip(what, convert, o).map(|t| Ok(WatchEvent::Added(t))),
                    Ok(KubeWatchEvent::Modified(o)) => Self::convert_or_skip(what, convert, o).map(|t| Ok(WatchEvent::Modified(t))),
                    Ok(KubeWatchEvent::Deleted(o)) => Self::convert_or_skip(what, convert, o).map(|t| Ok(WatchEvent::Deleted(t))),
                    Ok(KubeWatchEvent::Bookmark(b)) => Some(Ok(WatchEvent::Bookmark(b.metadata.resource_version))),
                    Ok(KubeWatchEvent::Error(ae)) if ae.code == 410 => Some(Err(StoreError::Gone(ae.message))),
                    Ok(KubeWatchEvent::Error(ae)) => Some(Err(StoreError::Api(format!("{what}: {}", ae.message)))),
                    Err(e) => Some(Err(e)),
                }
            });
        Ok(mapped.boxed())
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<T>> {
        let obj = self.object(key).get_opt(&key.name).await.map_err(|e| store_error(self.what, e))?;
        match obj {
            Some(o) => (self.convert)(o).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl<K> MetadataPatcher for KubeStore<K, WatchedResource>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn patch_metadata(&self, key: &ResourceKey, labels: &Labels, annotations: &Labels) -> Result<()> {
        let body = metadata_patch(labels, annotations);
        self.object(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| store_error(&key.to_string(), e))?;
        counter!("secmeta_metadata_patches_total", 1u64, "kind" => self.what);
        debug!(kind = self.what, key = %key, labels = labels.len(), annotations = annotations.len(), "metadata patched");
        Ok(())
    }
}

/// JSON merge patch touching only the given label and annotation keys.
pub fn metadata_patch(labels: &Labels, annotations: &Labels) -> serde_json::Value {
    let mut meta = serde_json::Map::new();
    if !labels.is_empty() {
        meta.insert("labels".into(), serde_json::json!(labels));
    }
    if !annotations.is_empty() {
        meta.insert("annotations".into(), serde_json::json!(annotations));
    }
    serde_json::json!({ "metadata": meta })
}
