//! secmeta core types shared by every engine: resource keys, the cached view of
//! watched images and pods, scan-service records and annotation records.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod image;
pub mod record;
pub mod results;

pub use image::{parse_image_id, ContainerImageRef, ImageRef};
pub use record::{AnnotationRecord, SummaryEntry};
pub use results::{ScanResults, ScannedImage, ScannedPod};

/// Label or annotation map. Ordered so generated patches are deterministic.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed image id: {0}")]
    ImageId(String),
    #[error("malformed resource key: {0:?}")]
    Key(String),
    #[error("malformed annotation record: {0}")]
    Record(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identity of a watched object: `namespace/name`, or just `name` when cluster scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.contains('/') => Self::namespaced(ns, name),
            Some(_) => return Err(Error::Key(s.to_string())),
            None => Self::cluster(s),
        };
        if key.name.is_empty() {
            return Err(Error::Key(s.to_string()));
        }
        Ok(key)
    }
}

/// What happened to a cached object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Anything that can live in a resource cache.
pub trait CacheObject: Clone + Send + Sync + 'static {
    fn key(&self) -> ResourceKey;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Pod,
}

/// Cached, possibly stale, view of an image or a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedResource {
    pub key: ResourceKey,
    pub kind: ResourceKind,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub labels: Labels,
    pub annotations: Labels,
    /// The digest-pinned reference an image object stands for. Images only.
    pub image: Option<ImageRef>,
    /// Container images in container-status order. Pods only.
    pub containers: Vec<ContainerImageRef>,
}

impl WatchedResource {
    pub fn new(kind: ResourceKind, key: ResourceKey) -> Self {
        Self {
            key,
            kind,
            uid: None,
            resource_version: None,
            labels: Labels::new(),
            annotations: Labels::new(),
            image: None,
            containers: Vec::new(),
        }
    }

    /// Content digests this resource refers to (its own for images, every resolved container for pods).
    pub fn digests(&self) -> Vec<String> {
        let mut out: Vec<String> = self.image.iter().map(|i| i.digest.clone()).collect();
        out.extend(self.containers.iter().filter_map(|c| c.image.as_ref()).map(|i| i.digest.clone()));
        out.sort();
        out.dedup();
        out
    }

    /// True when the update is worth reconciling: metadata or image references moved.
    pub fn needs_update(old: &Self, new: &Self) -> bool {
        old.labels != new.labels
            || old.annotations != new.annotations
            || old.image != new.image
            || old.containers != new.containers
    }
}

impl CacheObject for WatchedResource {
    fn key(&self) -> ResourceKey { self.key.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let k: ResourceKey = "ns1/pod1".parse().unwrap();
        assert_eq!(k, ResourceKey::namespaced("ns1", "pod1"));
        assert_eq!(k.to_string(), "ns1/pod1");
        let c: ResourceKey = "sha256:abc".parse().unwrap();
        assert_eq!(c.namespace(), None);
        assert_eq!(c.to_string(), "sha256:abc");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("".parse::<ResourceKey>().is_err());
        assert!("ns/".parse::<ResourceKey>().is_err());
        assert!("/name".parse::<ResourceKey>().is_err());
        assert!("a/b/c".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn needs_update_ignores_resource_version() {
        let mut a = WatchedResource::new(ResourceKind::Pod, ResourceKey::namespaced("ns", "p"));
        let mut b = a.clone();
        a.resource_version = Some("1".into());
        b.resource_version = Some("2".into());
        assert!(!WatchedResource::needs_update(&a, &b));
        b.labels.insert("team".into(), "a".into());
        assert!(WatchedResource::needs_update(&a, &b));
    }

    #[test]
    fn digests_cover_pod_containers() {
        let mut p = WatchedResource::new(ResourceKind::Pod, ResourceKey::namespaced("ns", "p"));
        p.containers.push(ContainerImageRef::new("a", Some(ImageRef::new("img", "AAA"))));
        p.containers.push(ContainerImageRef::new("b", None));
        p.containers.push(ContainerImageRef::new("c", Some(ImageRef::new("img", "AAA"))));
        assert_eq!(p.digests(), vec!["AAA".to_string()]);
    }
}
