//! Structured security annotation values.
//!
//! A record is stored as the JSON value of a single annotation key, following the
//! container-content annotation layout OpenShift consoles understand.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const RECORD_NAME: &str = "BlackDucksoftware";
pub const VULNERABILITY_DESCRIPTION: &str = "Vulnerability Info";
pub const POLICY_DESCRIPTION: &str = "Policy Info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEntry {
    pub label: String,
    pub data: String,
    pub severity_index: i64,
    #[serde(default)]
    pub reference: String,
}

impl SummaryEntry {
    pub fn new(label: impl Into<String>, data: impl Into<String>, severity_index: i64) -> Self {
        Self { label: label.into(), data: data.into(), severity_index, reference: String::new() }
    }
}

/// A security summary attached to an image or pod.
///
/// Equality ignores `timestamp`: two records describing the same findings at
/// different times are the same record. `summary` is compared positionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationRecord {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub scanner_version: String,
    pub compliant: bool,
    #[serde(default)]
    pub summary: Vec<SummaryEntry>,
}

impl PartialEq for AnnotationRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.reference == other.reference
            && self.scanner_version == other.scanner_version
            && self.compliant == other.compliant
            && self.summary == other.summary
    }
}

impl Eq for AnnotationRecord {}

impl AnnotationRecord {
    /// Vulnerability summary; compliant when there are none.
    pub fn vulnerabilities(count: u64, reference: &str, scanner_version: &str, timestamp: &str) -> Self {
        Self {
            name: RECORD_NAME.to_string(),
            description: VULNERABILITY_DESCRIPTION.to_string(),
            timestamp: timestamp.to_string(),
            reference: reference.to_string(),
            scanner_version: scanner_version.to_string(),
            compliant: count == 0,
            summary: vec![SummaryEntry::new("high", count.to_string(), 1)],
        }
    }

    /// Policy-violation summary; compliant when there are none.
    pub fn policy_violations(count: u64, reference: &str, scanner_version: &str, timestamp: &str) -> Self {
        Self {
            name: RECORD_NAME.to_string(),
            description: POLICY_DESCRIPTION.to_string(),
            timestamp: timestamp.to_string(),
            reference: reference.to_string(),
            scanner_version: scanner_version.to_string(),
            compliant: count == 0,
            summary: vec![SummaryEntry::new("important", count.to_string(), 1)],
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Record(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Record(e.to_string()))
    }
}

/// Compare two serialized records. Anything that does not parse is unequal.
pub fn same_record_json(a: &str, b: &str) -> bool {
    match (AnnotationRecord::from_json(a), AnnotationRecord::from_json(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bd(summary: Vec<SummaryEntry>, ts: &str) -> AnnotationRecord {
        AnnotationRecord {
            name: "BD".into(),
            description: String::new(),
            timestamp: ts.into(),
            reference: String::new(),
            scanner_version: String::new(),
            compliant: true,
            summary,
        }
    }

    #[test]
    fn equality_ignores_timestamp() {
        let t1 = bd(vec![SummaryEntry::new("high", "5", 1)], "2024-01-01T00:00:00Z");
        let t2 = bd(vec![SummaryEntry::new("high", "5", 1)], "2024-06-01T12:30:00Z");
        let other = bd(vec![SummaryEntry::new("high", "6", 1)], "2024-01-01T00:00:00Z");
        assert_eq!(t1, t2);
        assert_ne!(t1, other);
    }

    #[test]
    fn summary_order_and_length_matter() {
        let a = bd(vec![SummaryEntry::new("high", "1", 1), SummaryEntry::new("low", "2", 3)], "");
        let b = bd(vec![SummaryEntry::new("low", "2", 3), SummaryEntry::new("high", "1", 1)], "");
        let c = bd(vec![SummaryEntry::new("high", "1", 1)], "");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(c, a);
    }

    #[test]
    fn json_layout_is_camel_case() {
        let r = AnnotationRecord::vulnerabilities(5, "http://hub/p/1", "2024.1", "T");
        let v: serde_json::Value = serde_json::from_str(&r.to_json().unwrap()).unwrap();
        assert_eq!(v["name"], "BlackDucksoftware");
        assert_eq!(v["description"], "Vulnerability Info");
        assert_eq!(v["scannerVersion"], "2024.1");
        assert_eq!(v["compliant"], false);
        assert_eq!(v["summary"][0]["label"], "high");
        assert_eq!(v["summary"][0]["data"], "5");
        assert_eq!(v["summary"][0]["severityIndex"], 1);
    }

    #[test]
    fn policy_record_is_compliant_without_violations() {
        let r = AnnotationRecord::policy_violations(0, "", "", "T");
        assert!(r.compliant);
        assert_eq!(r.summary, vec![SummaryEntry::new("important", "0", 1)]);
    }

    #[test]
    fn json_comparison_rejects_garbage() {
        let a = AnnotationRecord::vulnerabilities(1, "", "", "T1").to_json().unwrap();
        let b = AnnotationRecord::vulnerabilities(1, "", "", "T2").to_json().unwrap();
        assert!(same_record_json(&a, &b));
        assert!(!same_record_json(&a, "not json"));
        assert!(!same_record_json("3", &b));
    }
}
