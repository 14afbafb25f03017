use std::sync::Arc;

use kube::{
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Api, Client,
};
use secmeta_core::{parse_image_id, ImageRef, ResourceKey, ResourceKind, WatchedResource};
use secmeta_store::{Result, StoreError};
use tracing::debug;

use crate::KubeStore;

/// `image.openshift.io/v1 Image` (cluster scoped, plural `images`).
pub const OPENSHIFT_IMAGE_GVK: (&str, &str, &str) = ("image.openshift.io", "v1", "Image");

fn image_resource() -> ApiResource {
    let (group, version, kind) = OPENSHIFT_IMAGE_GVK;
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(group, version, kind), "images")
}

/// OpenShift images. They are cluster scoped, so the namespace filter does not apply.
pub fn image_store(client: Client) -> KubeStore<DynamicObject, WatchedResource> {
    let ar = image_resource();
    let api_for = Arc::new(move |_ns: Option<&str>| Api::<DynamicObject>::all_with(client.clone(), &ar));
    KubeStore::new("image", None, api_for, watched_from_image)
}

/// Cached view of an image object. Images are named `sha256:<digest>`; the repository
/// name comes from `dockerImageReference` when it is digest-pinned.
pub fn watched_from_image(obj: DynamicObject) -> Result<WatchedResource> {
    let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Decode("image without metadata.name".into()))?;
    let mut out = WatchedResource::new(ResourceKind::Image, ResourceKey::cluster(name.clone()));
    out.uid = obj.metadata.uid.clone();
    out.resource_version = obj.metadata.resource_version.clone();
    out.labels = obj.metadata.labels.clone().unwrap_or_default();
    out.annotations = obj.metadata.annotations.clone().unwrap_or_default();
    let reference = obj.data.get("dockerImageReference").and_then(|v| v.as_str()).unwrap_or_default();
    out.image = match parse_image_id(reference) {
        Ok(r) => Some(r),
        Err(e) => {
            debug!(image = %name, error = %e, "dockerImageReference not digest pinned");
            name.strip_prefix("sha256:").map(|d| ImageRef::new(reference, d))
        }
    };
    Ok(out)
}
