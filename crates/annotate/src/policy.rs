//! Label/annotation generators and map comparators.
//!
//! Two flavors exist. `platform` writes plain keys (`image.vulnerabilities`,
//! `pod.overall-status`, ...) compared exactly. `blackduck` writes
//! `com.blackducksoftware.*` labels plus structured records under
//! `quality.{image,pod}.openshift.io/*.blackduck`, compared with the
//! timestamp-insensitive record equality.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use secmeta_core::record::same_record_json;
use secmeta_core::{AnnotationRecord, Labels, ScannedImage, ScannedPod};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const IMAGE_ANNOTATION_PREFIX: &str = "quality.image.openshift.io";
pub const POD_ANNOTATION_PREFIX: &str = "quality.pod.openshift.io";

const LABEL_VALUE_MAX: usize = 63;

/// Scan findings for one image plus the service versions that produced them.
#[derive(Debug, Clone, Copy)]
pub struct ImageFacts<'a> {
    pub scanned: &'a ScannedImage,
    pub server_version: &'a str,
    pub scanner_version: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct PodFacts<'a> {
    pub scanned: &'a ScannedPod,
    pub server_version: &'a str,
    pub scanner_version: &'a str,
}

/// Where image-level keys land: on the image itself, or on a pod under the
/// `image<N>` affix of the container at position `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<'a> {
    Image,
    Container { index: usize, image_name: &'a str },
}

/// Desired labels and annotations for scan findings.
pub trait AnnotationPolicy: Send + Sync {
    fn image_labels(&self, facts: &ImageFacts<'_>, slot: Slot<'_>) -> Labels;
    fn image_annotations(&self, facts: &ImageFacts<'_>, slot: Slot<'_>, timestamp: &str) -> Labels;
    fn pod_labels(&self, facts: &PodFacts<'_>) -> Labels;
    fn pod_annotations(&self, facts: &PodFacts<'_>, timestamp: &str) -> Labels;
}

/// Decides whether `current` already satisfies `desired`.
pub trait EqualityPolicy: Send + Sync {
    fn contains(&self, current: &Labels, desired: &Labels) -> bool;
}

/// Every desired key present with a byte-equal value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactContains;

impl EqualityPolicy for ExactContains {
    fn contains(&self, current: &Labels, desired: &Labels) -> bool {
        desired.iter().all(|(k, v)| current.get(k) == Some(v))
    }
}

/// Like [`ExactContains`], except desired values that are annotation records
/// compare with record equality (timestamps ignored).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordAwareContains;

impl EqualityPolicy for RecordAwareContains {
    fn contains(&self, current: &Labels, desired: &Labels) -> bool {
        desired.iter().all(|(k, want)| match current.get(k) {
            None => false,
            Some(have) if have == want => true,
            Some(have) => AnnotationRecord::from_json(want).is_ok() && same_record_json(have, want),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Platform,
    #[default]
    Blackduck,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Platform => "platform",
            Flavor::Blackduck => "blackduck",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown annotation flavor {0:?} (expected platform or blackduck)")]
pub struct UnknownFlavor(String);

impl FromStr for Flavor {
    type Err = UnknownFlavor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "platform" => Ok(Flavor::Platform),
            "blackduck" => Ok(Flavor::Blackduck),
            _ => Err(UnknownFlavor(s.to_string())),
        }
    }
}

/// The generator and comparator an annotator runs with.
#[derive(Clone)]
pub struct Policies {
    pub annotations: Arc<dyn AnnotationPolicy>,
    pub equality: Arc<dyn EqualityPolicy>,
}

impl Policies {
    pub fn new(annotations: Arc<dyn AnnotationPolicy>, equality: Arc<dyn EqualityPolicy>) -> Self {
        Self { annotations, equality }
    }

    pub fn for_flavor(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Platform => Self::new(Arc::new(PlatformPolicy), Arc::new(ExactContains)),
            Flavor::Blackduck => Self::new(Arc::new(BlackduckPolicy), Arc::new(RecordAwareContains)),
        }
    }
}

impl fmt::Debug for Policies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("Policies").finish_non_exhaustive() }
}

/// Label values are at most 63 characters of `[A-Za-z0-9._-]`, starting and ending alphanumeric.
/// Anything else becomes `.`.
pub fn sanitize_label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '.' })
        .take(LABEL_VALUE_MAX)
        .collect();
    mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

fn annotation_image_name(raw: &str) -> String { raw.replace('/', ".") }

fn insert(map: &mut Labels, key: String, value: impl Into<String>) { map.insert(key, value.into()); }

#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformPolicy;

impl AnnotationPolicy for PlatformPolicy {
    fn image_labels(&self, facts: &ImageFacts<'_>, slot: Slot<'_>) -> Labels {
        let mut out = Labels::new();
        let base = match slot {
            Slot::Image => "image".to_string(),
            Slot::Container { index, image_name } => {
                insert(&mut out, format!("image{index}"), sanitize_label_value(image_name));
                format!("image{index}")
            }
        };
        let s = facts.scanned;
        insert(&mut out, format!("{base}.policy-violations"), s.policy_violation_count.to_string());
        insert(&mut out, format!("{base}.vulnerabilities"), s.vulnerability_count.to_string());
        insert(&mut out, format!("{base}.overall-status"), sanitize_label_value(&s.overall_status));
        out
    }

    fn image_annotations(&self, facts: &ImageFacts<'_>, slot: Slot<'_>, _timestamp: &str) -> Labels {
        let mut out = Labels::new();
        let prefix = match slot {
            Slot::Image => String::new(),
            Slot::Container { index, image_name } => {
                insert(&mut out, format!("image{index}"), annotation_image_name(image_name));
                format!("image{index}.")
            }
        };
        let s = facts.scanned;
        insert(&mut out, format!("{prefix}policy-violations"), s.policy_violation_count.to_string());
        insert(&mut out, format!("{prefix}vulnerabilities"), s.vulnerability_count.to_string());
        insert(&mut out, format!("{prefix}overall-status"), s.overall_status.clone());
        insert(&mut out, format!("{prefix}scanner-version"), facts.scanner_version);
        insert(&mut out, format!("{prefix}server-version"), facts.server_version);
        insert(&mut out, format!("{prefix}project-endpoint"), s.components_url.clone());
        out
    }

    fn pod_labels(&self, facts: &PodFacts<'_>) -> Labels {
        let s = facts.scanned;
        let mut out = Labels::new();
        insert(&mut out, "pod.policy-violations".into(), s.policy_violation_count.to_string());
        insert(&mut out, "pod.vulnerabilities".into(), s.vulnerability_count.to_string());
        insert(&mut out, "pod.overall-status".into(), sanitize_label_value(&s.overall_status));
        out
    }

    fn pod_annotations(&self, facts: &PodFacts<'_>, _timestamp: &str) -> Labels {
        let mut out = Labels::new();
        insert(&mut out, "pod.scanner-version".into(), facts.scanner_version);
        insert(&mut out, "pod.server-version".into(), facts.server_version);
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlackduckPolicy;

fn record_json(record: &AnnotationRecord, key: &str) -> Option<String> {
    match record.to_json() {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(key, error = %e, "annotation record does not serialize; key left out");
            None
        }
    }
}

fn put_records(out: &mut Labels, prefix: String, vulns: AnnotationRecord, policy: AnnotationRecord) {
    let vkey = format!("{prefix}/vulnerability.blackduck");
    if let Some(v) = record_json(&vulns, &vkey) {
        out.insert(vkey, v);
    }
    let pkey = format!("{prefix}/policy.blackduck");
    if let Some(v) = record_json(&policy, &pkey) {
        out.insert(pkey, v);
    }
}

impl AnnotationPolicy for BlackduckPolicy {
    fn image_labels(&self, facts: &ImageFacts<'_>, slot: Slot<'_>) -> Labels {
        let mut out = Labels::new();
        let base = match slot {
            Slot::Image => "com.blackducksoftware.image".to_string(),
            Slot::Container { index, image_name } => {
                let base = format!("com.blackducksoftware.image{index}");
                insert(&mut out, base.clone(), sanitize_label_value(image_name));
                base
            }
        };
        let s = facts.scanned;
        insert(&mut out, format!("{base}.policy-violations"), s.policy_violation_count.to_string());
        insert(&mut out, format!("{base}.has-policy-violations"), (s.policy_violation_count > 0).to_string());
        insert(&mut out, format!("{base}.vulnerabilities"), s.vulnerability_count.to_string());
        insert(&mut out, format!("{base}.has-vulnerabilities"), (s.vulnerability_count > 0).to_string());
        insert(&mut out, format!("{base}.overall-status"), sanitize_label_value(&s.overall_status));
        out
    }

    fn image_annotations(&self, facts: &ImageFacts<'_>, slot: Slot<'_>, timestamp: &str) -> Labels {
        let mut out = Labels::new();
        let prefix = match slot {
            Slot::Image => String::new(),
            Slot::Container { index, image_name } => {
                let prefix = format!("image{index}.");
                let name = annotation_image_name(image_name);
                insert(&mut out, format!("{prefix}blackducksoftware.com"), name.clone());
                insert(&mut out, format!("{prefix}{IMAGE_ANNOTATION_PREFIX}"), name);
                prefix
            }
        };
        let s = facts.scanned;
        insert(&mut out, format!("{prefix}blackducksoftware.com/hub-scanner-version"), facts.scanner_version);
        insert(&mut out, format!("{prefix}blackducksoftware.com/attestation-server-version"), facts.server_version);
        insert(&mut out, format!("{prefix}blackducksoftware.com/project-endpoint"), s.components_url.clone());
        put_records(
            &mut out,
            format!("{prefix}{IMAGE_ANNOTATION_PREFIX}"),
            AnnotationRecord::vulnerabilities(s.vulnerability_count, &s.components_url, facts.scanner_version, timestamp),
            AnnotationRecord::policy_violations(s.policy_violation_count, &s.components_url, facts.scanner_version, timestamp),
        );
        out
    }

    fn pod_labels(&self, facts: &PodFacts<'_>) -> Labels {
        let s = facts.scanned;
        let mut out = Labels::new();
        insert(&mut out, "com.blackducksoftware.pod.policy-violations".into(), s.policy_violation_count.to_string());
        insert(&mut out, "com.blackducksoftware.pod.has-policy-violations".into(), (s.policy_violation_count > 0).to_string());
        insert(&mut out, "com.blackducksoftware.pod.vulnerabilities".into(), s.vulnerability_count.to_string());
        insert(&mut out, "com.blackducksoftware.pod.has-vulnerabilities".into(), (s.vulnerability_count > 0).to_string());
        insert(&mut out, "com.blackducksoftware.pod.overall-status".into(), sanitize_label_value(&s.overall_status));
        out
    }

    fn pod_annotations(&self, facts: &PodFacts<'_>, timestamp: &str) -> Labels {
        let s = facts.scanned;
        let mut out = Labels::new();
        put_records(
            &mut out,
            POD_ANNOTATION_PREFIX.to_string(),
            AnnotationRecord::vulnerabilities(s.vulnerability_count, "", facts.scanner_version, timestamp),
            AnnotationRecord::policy_violations(s.policy_violation_count, "", facts.scanner_version, timestamp),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned(vulns: u64, policy: u64) -> ScannedImage {
        ScannedImage {
            name: "reg:5000/team/app".into(),
            content_digest: "AAA".into(),
            policy_violation_count: policy,
            vulnerability_count: vulns,
            overall_status: "IN_VIOLATION".into(),
            components_url: "http://hub/c/1".into(),
        }
    }

    fn facts(s: &ScannedImage) -> ImageFacts<'_> { ImageFacts { scanned: s, server_version: "2024.1", scanner_version: "7.0" } }

    fn labels(pairs: &[(&str, &str)]) -> Labels { pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect() }

    #[test]
    fn exact_contains_requires_equal_values() {
        let current = labels(&[("a", "1"), ("b", "2"), ("other", "x")]);
        assert!(ExactContains.contains(&current, &labels(&[("a", "1")])));
        assert!(!ExactContains.contains(&current, &labels(&[("a", "2")])));
        assert!(!ExactContains.contains(&current, &labels(&[("missing", "1")])));
        assert!(ExactContains.contains(&current, &Labels::new()));
    }

    #[test]
    fn record_aware_contains_ignores_timestamps_only() {
        let t1 = AnnotationRecord::vulnerabilities(5, "u", "7.0", "2024-01-01T00:00:00Z").to_json().unwrap();
        let t2 = AnnotationRecord::vulnerabilities(5, "u", "7.0", "2024-02-01T00:00:00Z").to_json().unwrap();
        let six = AnnotationRecord::vulnerabilities(6, "u", "7.0", "2024-01-01T00:00:00Z").to_json().unwrap();
        let current = labels(&[("k", &t1), ("plain", "v")]);
        assert!(RecordAwareContains.contains(&current, &labels(&[("k", &t2), ("plain", "v")])));
        assert!(!RecordAwareContains.contains(&current, &labels(&[("k", &six)])));
        assert!(!RecordAwareContains.contains(&current, &labels(&[("plain", "w")])));
        assert!(!ExactContains.contains(&current, &labels(&[("k", &t2)])));
    }

    #[test]
    fn sanitizes_label_values() {
        assert_eq!(sanitize_label_value("reg:5000/team/app"), "reg.5000.team.app");
        assert_eq!(sanitize_label_value(&"x".repeat(80)).len(), 63);
        assert_eq!(sanitize_label_value("img@sha256+build"), "img.sha256.build");
        assert_eq!(sanitize_label_value("/leading/"), "leading");
        assert_eq!(sanitize_label_value("ünïcode"), "n.code");
        let cut = format!("{}-tail", "a".repeat(62));
        assert_eq!(sanitize_label_value(&cut), "a".repeat(62));
        assert_eq!(sanitize_label_value("--"), "");
    }

    #[test]
    fn blackduck_container_slot_keys() {
        let s = scanned(5, 0);
        let f = facts(&s);
        let slot = Slot::Container { index: 2, image_name: "reg:5000/team/app" };
        let l = BlackduckPolicy.image_labels(&f, slot);
        assert_eq!(l["com.blackducksoftware.image2"], "reg.5000.team.app");
        assert_eq!(l["com.blackducksoftware.image2.vulnerabilities"], "5");
        assert_eq!(l["com.blackducksoftware.image2.has-vulnerabilities"], "true");
        assert_eq!(l["com.blackducksoftware.image2.has-policy-violations"], "false");

        let a = BlackduckPolicy.image_annotations(&f, slot, "T");
        assert_eq!(a["image2.blackducksoftware.com"], "reg:5000.team.app");
        assert_eq!(a["image2.quality.image.openshift.io"], "reg:5000.team.app");
        assert_eq!(a["image2.blackducksoftware.com/project-endpoint"], "http://hub/c/1");
        let rec = AnnotationRecord::from_json(&a["image2.quality.image.openshift.io/vulnerability.blackduck"]).unwrap();
        assert!(!rec.compliant);
        assert_eq!(rec.reference, "http://hub/c/1");
        let pol = AnnotationRecord::from_json(&a["image2.quality.image.openshift.io/policy.blackduck"]).unwrap();
        assert!(pol.compliant);
    }

    #[test]
    fn image_slot_has_no_affix() {
        let s = scanned(0, 1);
        let f = facts(&s);
        let l = PlatformPolicy.image_labels(&f, Slot::Image);
        assert_eq!(l.keys().collect::<Vec<_>>(), vec!["image.overall-status", "image.policy-violations", "image.vulnerabilities"]);
        let a = BlackduckPolicy.image_annotations(&f, Slot::Image, "T");
        assert!(a.contains_key("quality.image.openshift.io/vulnerability.blackduck"));
        assert!(a.contains_key("blackducksoftware.com/hub-scanner-version"));
    }

    #[test]
    fn pod_keys_per_flavor() {
        let pod = ScannedPod { name: "p".into(), namespace: "ns".into(), policy_violation_count: 1, vulnerability_count: 0, overall_status: "IN_VIOLATION".into() };
        let f = PodFacts { scanned: &pod, server_version: "2024.1", scanner_version: "7.0" };
        let a = PlatformPolicy.pod_annotations(&f, "T");
        assert_eq!(a, labels(&[("pod.scanner-version", "7.0"), ("pod.server-version", "2024.1")]));
        let a = BlackduckPolicy.pod_annotations(&f, "T");
        let pol = AnnotationRecord::from_json(&a["quality.pod.openshift.io/policy.blackduck"]).unwrap();
        assert!(!pol.compliant);
        assert_eq!(BlackduckPolicy.pod_labels(&f)["com.blackducksoftware.pod.has-policy-violations"], "true");
    }

    #[test]
    fn flavor_parses_case_insensitively() {
        assert_eq!("Platform".parse::<Flavor>().unwrap(), Flavor::Platform);
        assert_eq!(Flavor::default(), Flavor::Blackduck);
        assert!("other".parse::<Flavor>().is_err());
    }
}
