//! Aggregate scan results as published by the scan service.
//!
//! Field names follow the service's camelCase JSON; the older PascalCase names
//! are accepted as aliases.

use serde::{Deserialize, Deserializer, Serialize};

use crate::ImageRef;

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedImage {
    #[serde(alias = "Name", default)]
    pub name: String,
    #[serde(alias = "Sha", alias = "sha", default)]
    pub content_digest: String,
    #[serde(alias = "PolicyViolations", alias = "policyViolations", default)]
    pub policy_violation_count: u64,
    #[serde(alias = "Vulnerabilities", alias = "vulnerabilities", default)]
    pub vulnerability_count: u64,
    #[serde(alias = "OverallStatus", default)]
    pub overall_status: String,
    #[serde(rename = "componentsURL", alias = "ComponentsURL", alias = "componentsUrl", default)]
    pub components_url: String,
}

impl ScannedImage {
    pub fn image_ref(&self) -> ImageRef { ImageRef::new(self.name.clone(), self.content_digest.clone()) }

    pub fn matches(&self, image: &ImageRef) -> bool {
        self.name == image.name && self.content_digest == image.digest
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedPod {
    #[serde(alias = "Name", default)]
    pub name: String,
    #[serde(alias = "Namespace", default)]
    pub namespace: String,
    #[serde(alias = "PolicyViolations", alias = "policyViolations", default)]
    pub policy_violation_count: u64,
    #[serde(alias = "Vulnerabilities", alias = "vulnerabilities", default)]
    pub vulnerability_count: u64,
    #[serde(alias = "OverallStatus", default)]
    pub overall_status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResults {
    #[serde(alias = "HubVersion", default, deserialize_with = "null_as_default")]
    pub hub_version: String,
    #[serde(alias = "HubScanClientVersion", alias = "hubScanClientVersion", default, deserialize_with = "null_as_default")]
    pub scanner_version: String,
    #[serde(alias = "Pods", default, deserialize_with = "null_as_default")]
    pub pods: Vec<ScannedPod>,
    #[serde(alias = "Images", default, deserialize_with = "null_as_default")]
    pub images: Vec<ScannedImage>,
}

impl ScanResults {
    pub fn find_image(&self, image: &ImageRef) -> Option<&ScannedImage> {
        self.images.iter().find(|s| s.matches(image))
    }

    pub fn find_pod(&self, namespace: &str, name: &str) -> Option<&ScannedPod> {
        self.pods.iter().find(|p| p.namespace == namespace && p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_camel_case_payload() {
        let raw = r#"{"hubVersion":"2024.1","scannerVersion":"9.0","pods":[{"name":"p","namespace":"ns","policyViolationCount":1,"vulnerabilityCount":2,"overallStatus":"NOT_IN_VIOLATION"}],"images":[{"name":"img1","contentDigest":"AAA","vulnerabilityCount":5,"componentsURL":"http://hub/x"}]}"#;
        let r: ScanResults = serde_json::from_str(raw).unwrap();
        assert_eq!(r.hub_version, "2024.1");
        assert_eq!(r.pods[0].vulnerability_count, 2);
        assert_eq!(r.images[0].content_digest, "AAA");
        assert_eq!(r.images[0].components_url, "http://hub/x");
        assert!(r.find_pod("ns", "p").is_some());
        assert!(r.find_image(&ImageRef::new("img1", "AAA")).is_some());
        assert!(r.find_image(&ImageRef::new("other", "AAA")).is_none());
    }

    #[test]
    fn decodes_legacy_pascal_case_and_nulls() {
        let raw = r#"{"HubVersion":"4.8","HubScanClientVersion":"4.8.1","Pods":null,"Images":[{"Name":"image1","Sha":"ASDJ4","PolicyViolations":3,"Vulnerabilities":10,"OverallStatus":"IN_VIOLATION","ComponentsURL":"u"}]}"#;
        let r: ScanResults = serde_json::from_str(raw).unwrap();
        assert_eq!(r.scanner_version, "4.8.1");
        assert!(r.pods.is_empty());
        assert_eq!(r.images[0].policy_violation_count, 3);
        assert_eq!(r.images[0].vulnerability_count, 10);
    }
}
