//! Container image references and image-id parsing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

static PULLABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^docker-pullable://(.+)@sha256:([a-zA-Z0-9]+)$").expect("pullable image id regex"));
static PINNED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)@sha256:([a-zA-Z0-9]+)$").expect("pinned image id regex"));

/// An image identified by repository name and content digest (hex, without `sha256:`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub digest: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, digest: impl Into<String>) -> Self {
        Self { name: name.into(), digest: digest.into() }
    }

    /// `name@sha256:digest`, the form a registry can pull.
    pub fn pull_spec(&self) -> String { format!("{}@sha256:{}", self.name, self.digest) }
}

/// One container of a pod. `image` is `None` until the runtime reports a resolvable image id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerImageRef {
    pub container: String,
    pub image: Option<ImageRef>,
}

impl ContainerImageRef {
    pub fn new(container: impl Into<String>, image: Option<ImageRef>) -> Self {
        Self { container: container.into(), image }
    }
}

/// Parse a runtime image id into name and digest.
///
/// Accepts `docker-pullable://<name>@sha256:<digest>` and `<name>@sha256:<digest>`.
/// `docker://` ids belong to images that were never pulled by digest and are rejected.
pub fn parse_image_id(image_id: &str) -> Result<ImageRef> {
    let re: &Regex = if image_id.starts_with("docker-pullable://") {
        &PULLABLE_RE
    } else if image_id.starts_with("docker://") {
        return Err(Error::ImageId(format!("unscheduled image {image_id} has no pullable digest")));
    } else {
        &PINNED_RE
    };
    let caps = re.captures(image_id).ok_or_else(|| Error::ImageId(image_id.to_string()))?;
    match (caps.get(1), caps.get(2)) {
        (Some(name), Some(digest)) => Ok(ImageRef::new(name.as_str(), digest.as_str())),
        _ => Err(Error::ImageId(image_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pullable_ids() {
        let r = parse_image_id("docker-pullable://registry.example.com/team/app@sha256:cb4983d8399a").unwrap();
        assert_eq!(r.name, "registry.example.com/team/app");
        assert_eq!(r.digest, "cb4983d8399a");
        assert_eq!(r.pull_spec(), "registry.example.com/team/app@sha256:cb4983d8399a");
    }

    #[test]
    fn parses_bare_pinned_ids() {
        let r = parse_image_id("repository.com/notscanned@sha256:34545ngelkj235knegr").unwrap();
        assert_eq!(r, ImageRef::new("repository.com/notscanned", "34545ngelkj235knegr"));
    }

    #[test]
    fn rejects_unscheduled_and_garbage() {
        assert!(parse_image_id("docker://sha256:abcdef").is_err());
        assert!(parse_image_id("nginx:latest").is_err());
        assert!(parse_image_id("docker-pullable://nginx").is_err());
        assert!(parse_image_id("").is_err());
    }
}
