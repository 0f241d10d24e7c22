use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::KB_PER_MB;

// --- Test status lattice ---

/// Lifecycle of a test run: queued < running < {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TestStatus {
    fn rank(self) -> u8 {
        match self {
            TestStatus::Queued => 0,
            TestStatus::Running => 1,
            TestStatus::Completed | TestStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Completed | TestStatus::Failed)
    }

    /// Whether a record currently in `self` may move to `next`.
    /// Terminal states are sticky, including against the other terminal state.
    pub fn accepts(self, next: TestStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Queued => "queued",
            TestStatus::Running => "running",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown test status: {0}")]
pub struct UnknownStatus(String);

impl FromStr for TestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TestStatus::Queued),
            "running" => Ok(TestStatus::Running),
            "completed" => Ok(TestStatus::Completed),
            "failed" => Ok(TestStatus::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for TestStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// --- Test records ---

/// Canonical view of one test run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub test_id: String,
    pub campaign: String,
    pub status: TestStatus,
    pub num_clients: u64,
    pub num_requests: u64,
    pub success: u64,
    pub failures: u64,
    pub duration: f64,
    pub throughput: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl TestRecord {
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            campaign: String::new(),
            status: TestStatus::Queued,
            num_clients: 0,
            num_requests: 0,
            success: 0,
            failures: 0,
            duration: 0.0,
            throughput: 0.0,
            timestamp: None,
        }
    }
}

/// Partial test record as delivered by the event stream, the history poll,
/// the structured log or a start acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUpdate {
    pub test_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_clients: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    #[serde(
        default,
        alias = "date",
        deserialize_with = "flexible_timestamp::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TestUpdate {
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: TestStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Instants arrive either as RFC 3339 strings or as epoch milliseconds.
pub mod flexible_timestamp {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Text(String),
        Millis(i64),
        Float(f64),
    }

    fn convert<E: serde::de::Error>(raw: RawTimestamp) -> Result<DateTime<Utc>, E> {
        match raw {
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| E::custom(format!("invalid timestamp {:?}: {}", text, e))),
            RawTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {}", ms))),
            RawTimestamp::Float(ms) => Utc
                .timestamp_millis_opt(ms as i64)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {}", ms))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        convert(RawTimestamp::deserialize(d)?)
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<RawTimestamp>::deserialize(d)? {
            Some(raw) => convert(raw).map(Some),
            None => Ok(None),
        }
    }
}

// --- Campaigns ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(alias = "ftp")]
    FTP,
    #[serde(alias = "sftp")]
    SFTP,
    #[serde(alias = "http")]
    HTTP,
    #[serde(alias = "https")]
    HTTPS,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    #[serde(alias = "UPLOAD", alias = "upload")]
    Upload,
    #[serde(alias = "DOWNLOAD", alias = "download")]
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    #[serde(alias = "K", alias = "kb")]
    KB,
    #[serde(alias = "M", alias = "mb")]
    MB,
}

/// Weighted file-size rule: `percent` of transfers use files of `size` `unit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesizePolicy {
    #[serde(rename = "Size", alias = "size", deserialize_with = "int_or_string")]
    pub size: u64,
    #[serde(rename = "Unit", alias = "unit")]
    pub unit: SizeUnit,
    #[serde(rename = "Percent", alias = "percent", deserialize_with = "int_or_string")]
    pub percent: u64,
}

impl FilesizePolicy {
    pub fn size_kb(&self) -> f64 {
        match self.unit {
            SizeUnit::KB => self.size as f64,
            SizeUnit::MB => self.size as f64 * KB_PER_MB,
        }
    }
}

/// Campaign forms submit numbers as strings.
fn int_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(d)? {
        Raw::Int(n) => Ok(n),
        Raw::Float(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as u64),
        Raw::Float(f) => Err(serde::de::Error::custom(format!(
            "expected a non-negative integer, got {}",
            f
        ))),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid number string: {}", s))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub name: String,
    #[serde(rename = "Protocol")]
    pub protocol: Protocol,
    #[serde(rename = "Type")]
    pub transfer_type: TransferType,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Path", default = "default_path")]
    pub path: String,
    #[serde(rename = "Timeout", default)]
    pub timeout: u32,
    #[serde(rename = "FilesizePolicies", default)]
    pub filesize_policies: Vec<FilesizePolicy>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Campaign {
    /// Every authoring problem with this campaign; empty when it can be saved.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.hostname.trim().is_empty() {
            problems.push("Hostname must not be empty".to_string());
        }
        if self.port == 0 {
            problems.push("Port must be non-zero".to_string());
        }
        if self.filesize_policies.is_empty() {
            problems.push("FilesizePolicies must contain at least one policy".to_string());
        }
        for (i, policy) in self.filesize_policies.iter().enumerate() {
            if policy.percent > 100 {
                problems.push(format!(
                    "FilesizePolicies[{}].Percent must be between 0 and 100",
                    i
                ));
            }
        }
        let total: u64 = self.filesize_policies.iter().map(|p| p.percent).sum();
        if !self.filesize_policies.is_empty() && total != 100 {
            problems.push(format!(
                "FilesizePolicies percentages must sum to 100 (got {})",
                total
            ));
        }
        problems
    }

    /// Expected file size in KB, weighted by policy percentage.
    pub fn average_file_size_kb(&self) -> f64 {
        self.filesize_policies
            .iter()
            .map(|p| p.size_kb() * p.percent as f64 / 100.0)
            .sum()
    }
}

// --- Test start ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTestRequest {
    pub campaign: String,
    pub workers: u64,
    pub requests: u64,
    #[serde(default)]
    pub cli: bool,
}

impl StartTestRequest {
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.campaign.trim().is_empty() {
            problems.push("campaign must not be empty".to_string());
        }
        if self.workers == 0 {
            problems.push("workers must be a positive integer".to_string());
        }
        if self.requests == 0 {
            problems.push("requests must be a positive integer".to_string());
        }
        problems
    }

    /// Provisional record for an acknowledged start.
    pub fn acknowledged(&self, test_id: &str) -> TestUpdate {
        TestUpdate {
            campaign: Some(self.campaign.clone()),
            status: Some(TestStatus::Queued),
            num_clients: Some(self.workers),
            num_requests: Some(self.requests),
            timestamp: Some(Utc::now()),
            ..TestUpdate::new(test_id)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTestResponse {
    pub test_id: String,
}
