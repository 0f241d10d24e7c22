//! Report documents: schema, validation and loading.
//!
//! A report is the JSON artifact a completed test run writes. Uploaded
//! documents are checked against the required-field schema with every
//! violation collected, and only then deserialized into [`ReportDocument`].

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::model::FilesizePolicy;

pub const REQUIRED_TOP_LEVEL: &[&str] = &[
    "config",
    "summary",
    "latencies",
    "throughputs",
    "errors",
    "timestamp",
];
pub const REQUIRED_CONFIG: &[&str] = &["Protocol", "Host", "Port", "FilesizePolicies"];
pub const REQUIRED_SUMMARY: &[&str] = &[
    "total_requests",
    "successful_requests",
    "failed_requests",
    "avg_latency_ms",
    "min_latency_ms",
    "max_latency_ms",
];

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("report must be a JSON object")]
    NotAnObject,

    #[error("report is missing or has invalid fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("report fields have unexpected types: {0}")]
    Schema(#[source] serde_json::Error),

    #[error("failed to read report file: {0}")]
    Io(#[from] std::io::Error),
}

impl ReportError {
    /// Offending field names, when the failure is a schema violation.
    pub fn fields(&self) -> &[String] {
        match self {
            ReportError::MissingFields(fields) => fields,
            _ => &[],
        }
    }
}

// --- Schema ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "Type", default)]
    pub transfer_type: Option<String>,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "FilesizePolicies", deserialize_with = "null_as_empty")]
    pub filesize_policies: Vec<FilesizePolicy>,
    #[serde(rename = "NumClients", default)]
    pub num_clients: Option<u64>,
    #[serde(rename = "NumRequests", default)]
    pub num_requests: Option<u64>,
    #[serde(rename = "TestID", default)]
    pub test_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    #[serde(default)]
    pub p25: f64,
    #[serde(default)]
    pub p50: f64,
    #[serde(default)]
    pub p75: f64,
    #[serde(default)]
    pub p90: f64,
    #[serde(default)]
    pub p95: f64,
    #[serde(default)]
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    #[serde(default)]
    pub percentiles: Percentiles,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub error_distribution: BTreeMap<String, u64>,
    #[serde(default)]
    pub total_data_kb: f64,
    #[serde(default)]
    pub avg_throughput_mbps: f64,
    #[serde(default)]
    pub peak_throughput_mbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSample {
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub data_transferred_kb: f64,
    #[serde(default)]
    pub throughput_mbps: f64,
    #[serde(default)]
    pub throughput_rps: f64,
    #[serde(default)]
    pub avg_latency_ms: f64,
}

/// Error kind → occurrence count. Runners that write a plain list of error
/// messages are counted into the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ErrorCounts(pub BTreeMap<String, u64>);

impl<'de> Deserialize<'de> for ErrorCounts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Counts(BTreeMap<String, u64>),
            Messages(Vec<String>),
            Missing(()),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Counts(counts) => ErrorCounts(counts),
            Raw::Messages(messages) => {
                let mut counts = BTreeMap::new();
                for message in messages {
                    *counts.entry(message).or_insert(0) += 1;
                }
                ErrorCounts(counts)
            }
            Raw::Missing(()) => ErrorCounts::default(),
        })
    }
}

impl ErrorCounts {
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

/// A validated report. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub config: ReportConfig,
    pub summary: ReportSummary,
    #[serde(deserialize_with = "null_as_empty")]
    pub latencies: Vec<f64>,
    #[serde(deserialize_with = "null_as_empty")]
    pub throughputs: Vec<f64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub time_series: Vec<TimeSeriesSample>,
    pub errors: ErrorCounts,
    pub timestamp: DateTime<FixedOffset>,
}

/// The runner serializes empty slices and maps as `null`.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// --- Validation ---

/// Check `document` against the required-field schema, collecting every
/// violation into a single [`ReportError::MissingFields`].
pub fn validate(document: &Value) -> Result<(), ReportError> {
    let root = document.as_object().ok_or(ReportError::NotAnObject)?;
    let mut problems = Vec::new();

    for key in REQUIRED_TOP_LEVEL {
        if !root.contains_key(*key) {
            problems.push((*key).to_string());
        }
    }

    check_object(root.get("config"), "config", REQUIRED_CONFIG, &mut problems);

    match root.get("latencies") {
        None => {}
        Some(Value::Array(values)) => {
            for (i, value) in values.iter().enumerate() {
                if !value.is_number() {
                    problems.push(format!("latencies[{}]", i));
                }
            }
        }
        Some(_) => problems.push("latencies (not an array)".to_string()),
    }

    check_object(root.get("summary"), "summary", REQUIRED_SUMMARY, &mut problems);

    match root.get("timestamp") {
        None => {}
        Some(Value::String(text)) if DateTime::parse_from_rfc3339(text).is_ok() => {}
        Some(_) => problems.push("timestamp (not a valid instant)".to_string()),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ReportError::MissingFields(problems))
    }
}

fn check_object(value: Option<&Value>, name: &str, required: &[&str], problems: &mut Vec<String>) {
    match value {
        // Already reported as a missing top-level key.
        None => {}
        Some(Value::Object(fields)) => {
            for key in required {
                if !fields.contains_key(*key) {
                    problems.push(format!("{}.{}", name, key));
                }
            }
        }
        Some(_) => problems.push(format!("{} (not an object)", name)),
    }
}

/// Parse, validate and type a report document.
pub fn parse_report(bytes: &[u8]) -> Result<ReportDocument, ReportError> {
    let value: Value = serde_json::from_slice(bytes).map_err(ReportError::Json)?;
    validate(&value)?;
    serde_json::from_value(value).map_err(ReportError::Schema)
}

pub async fn load_report(path: &Path) -> Result<ReportDocument, ReportError> {
    let bytes = tokio::fs::read(path).await?;
    parse_report(&bytes)
}
