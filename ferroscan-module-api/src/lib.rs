//! ferroscan-module-api: wire types for the ferroscan module system
//!
//! This crate defines the JSON payloads exchanged between the host and a
//! Wasm analyzer module: the result of analyzing a single file, and the
//! projection of a scan report handed to `post_scan`.
//!
//! Payload schemas evolve independently of the host. Every type captures
//! fields it does not know about in an `extra` map, so a payload produced by
//! a newer module survives a round trip through an older host untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operating system identification produced by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    /// OS family, e.g. `"debian"`.
    pub family: String,
    /// Release name or version string.
    pub name: String,
}

/// A package discovered in the scanned artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    /// Path of the file the package was found in, when the analyzer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// Result of analyzing a single input file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<Package>,
    /// Fields this host version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalysisResult {
    /// True when the analyzer reported nothing.
    pub fn is_empty(&self) -> bool {
        self.os.is_none() && self.packages.is_empty() && self.extra.is_empty()
    }
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

/// A single finding attached to a scan result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry in a scan report, covering a single target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The final scan report. Only the `results` vector crosses the module
/// boundary; `post_scan` receives it as a JSON array and returns the
/// replacement wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub artifact_name: String,
    #[serde(default)]
    pub results: Vec<ScanResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_analysis_result_decodes() {
        let result: AnalysisResult = serde_json::from_str(r#"{"os":null,"packages":[]}"#).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn analysis_result_round_trips() {
        let result = AnalysisResult {
            os: Some(OsInfo {
                family: "alpine".into(),
                name: "3.20".into(),
            }),
            packages: vec![Package {
                name: "musl".into(),
                version: "1.2.5".into(),
                file_path: Some("lib/apk/db/installed".into()),
            }],
            extra: Map::new(),
        };

        let text = serde_json::to_string(&result).unwrap();
        let decoded: AnalysisResult = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let original = json!({
            "os": null,
            "packages": [],
            "custom": {"answer": 42}
        });

        let decoded: AnalysisResult = serde_json::from_value(original).unwrap();
        assert_eq!(decoded.extra["custom"], json!({"answer": 42}));

        let encoded = serde_json::to_value(&decoded).unwrap();
        assert_eq!(encoded["custom"], json!({"answer": 42}));
    }

    #[test]
    fn scan_results_round_trip_field_by_field() {
        let results = vec![
            ScanResult {
                target: "lib/apk/db/installed".into(),
                findings: vec![Finding {
                    id: "CVE-2024-0001".into(),
                    severity: Severity::High,
                    message: "outdated musl".into(),
                    extra: Map::new(),
                }],
                extra: Map::new(),
            },
            ScanResult {
                target: "usr/bin/app".into(),
                findings: Vec::new(),
                extra: Map::new(),
            },
        ];

        let text = serde_json::to_string(&results).unwrap();
        let decoded: Vec<ScanResult> = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, results);
    }

    #[test]
    fn severity_uses_uppercase_wire_names() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"CRITICAL\""
        );
        let decoded: Severity = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(decoded, Severity::Low);
    }
}
