use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, BackendError};
use crate::log_capture::RawLogLine;
use crate::model::{flexible_timestamp, TestStatus, TestUpdate};
use crate::state::SharedState;
use crate::store::UpdateSource;

/// One line of the backend's newline-delimited structured test log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LogEntry {
    TestStart {
        test_id: String,
        #[serde(default)]
        campaign: Option<String>,
        #[serde(default)]
        num_clients: Option<u64>,
        #[serde(default)]
        num_requests: Option<u64>,
        #[serde(default, deserialize_with = "flexible_timestamp::deserialize_opt")]
        timestamp: Option<DateTime<Utc>>,
    },
    Result {
        test_id: String,
        #[serde(default)]
        success: Option<u64>,
        #[serde(default)]
        failures: Option<u64>,
        #[serde(default)]
        duration: Option<f64>,
    },
    Status {
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        success: Option<u64>,
        #[serde(default)]
        failures: Option<u64>,
    },
    Log {
        #[serde(default)]
        message: String,
        #[serde(default, deserialize_with = "flexible_timestamp::deserialize_opt")]
        timestamp: Option<DateTime<Utc>>,
    },
}

/// Parse one log line. Blank and malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!("Skipping unparseable log line: {}", e);
            None
        }
    }
}

/// Live progress of the running test, fed by `status` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveProgress {
    pub progress: f64,
    pub success: u64,
    pub failures: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of feeding the log artifact to a [`LogTailer`].
#[derive(Debug, Default)]
pub struct TailBatch {
    /// Reconstructed lifecycles, most recent first. Empty when no lifecycle changed.
    pub records: Vec<TestUpdate>,
    pub new_logs: Vec<RawLogLine>,
    pub progress: Option<LiveProgress>,
    pub parsed: usize,
    pub skipped: usize,
    /// The artifact shrank and the tailer started over.
    pub reset: bool,
}

/// Incremental reader for an append-only log artifact that is re-read in full.
#[derive(Debug, Default)]
pub struct LogTailer {
    cursor: usize,
    lines_seen: usize,
    order: Vec<String>,
    lifecycles: HashMap<String, TestUpdate>,
    progress: Option<LiveProgress>,
}

impl LogTailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }

    /// Consume every complete line past the cursor. A trailing line without a
    /// newline is left for the next read.
    pub fn ingest(&mut self, content: &str) -> TailBatch {
        let mut batch = TailBatch::default();

        let pending = match content.get(self.cursor..) {
            Some(pending) => pending,
            None => {
                info!(
                    "Log artifact shrank ({} < {} bytes), re-reading from the start",
                    content.len(),
                    self.cursor
                );
                *self = Self::default();
                batch.reset = true;
                content
            }
        };

        let complete = pending.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let mut touched = HashSet::new();

        for raw in pending[..complete].lines() {
            self.lines_seen += 1;
            if raw.trim().is_empty() {
                continue;
            }
            let Some(entry) = parse_line(raw) else {
                batch.skipped += 1;
                continue;
            };
            batch.parsed += 1;
            if let Some(test_id) = self.fold(entry, &mut batch) {
                touched.insert(test_id);
            }
        }
        self.cursor += complete;

        // Only lifecycles this read touched; earlier ones were already merged
        // and may since have been deleted.
        batch.records = self
            .records()
            .into_iter()
            .filter(|record| touched.contains(&record.test_id))
            .collect();
        batch
    }

    /// Apply one entry. Returns the id of the lifecycle it changed, if any.
    fn fold(&mut self, entry: LogEntry, batch: &mut TailBatch) -> Option<String> {
        match entry {
            LogEntry::TestStart {
                test_id,
                campaign,
                num_clients,
                num_requests,
                timestamp,
            } => {
                if !self.lifecycles.contains_key(&test_id) {
                    self.order.push(test_id.clone());
                }
                let seeded = TestUpdate {
                    campaign,
                    status: Some(TestStatus::Running),
                    num_clients,
                    num_requests,
                    timestamp,
                    ..TestUpdate::new(test_id.clone())
                };
                self.lifecycles.insert(test_id.clone(), seeded);
                Some(test_id)
            }
            LogEntry::Result {
                test_id,
                success,
                failures,
                duration,
            } => match self.lifecycles.get_mut(&test_id) {
                Some(record) => {
                    record.success = success.or(record.success);
                    record.failures = failures.or(record.failures);
                    record.duration = duration.or(record.duration);
                    record.status = Some(TestStatus::Completed);
                    Some(test_id)
                }
                None => {
                    debug!(test_id = %test_id, "Ignoring result without a matching testStart");
                    None
                }
            },
            LogEntry::Status {
                progress,
                success,
                failures,
            } => {
                if let Some(progress) = progress {
                    let current = self.progress.get_or_insert_with(LiveProgress::default);
                    current.progress = progress.clamp(0.0, 100.0);
                    current.success = success.unwrap_or(current.success);
                    current.failures = failures.unwrap_or(current.failures);
                    current.updated_at = Some(Utc::now());
                    batch.progress = Some(current.clone());
                }
                None
            }
            LogEntry::Log { message, timestamp } => {
                batch.new_logs.push(RawLogLine {
                    line: self.lines_seen,
                    timestamp,
                    message,
                });
                None
            }
        }
    }

    /// Accumulated lifecycles, most recent first.
    pub fn records(&self) -> Vec<TestUpdate> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.lifecycles.get(id).cloned())
            .collect()
    }
}

// --- Background task ---

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to read log file: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the structured test log is read from.
#[derive(Debug, Clone)]
pub enum LogSource {
    Backend,
    File(PathBuf),
}

impl LogSource {
    pub fn new(log_file: Option<PathBuf>) -> Self {
        match log_file {
            Some(path) => LogSource::File(path),
            None => LogSource::Backend,
        }
    }

    pub async fn read(&self, backend: &BackendClient) -> Result<String, TailError> {
        match self {
            LogSource::Backend => Ok(backend.fetch_log().await?),
            LogSource::File(path) => {
                let bytes = tokio::fs::read(path).await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }
}

/// Read the log once and push what changed into shared state.
pub async fn tail_once(
    state: &SharedState,
    source: &LogSource,
    tailer: &mut LogTailer,
) -> Result<TailBatch, TailError> {
    let content = source.read(&state.backend).await?;
    let mut batch = tailer.ingest(&content);

    if batch.reset {
        state.logs.clear().await;
        *state.progress.write().await = LiveProgress::default();
    }
    state.logs.extend(std::mem::take(&mut batch.new_logs)).await;
    if let Some(progress) = &batch.progress {
        *state.progress.write().await = progress.clone();
    }
    if !batch.records.is_empty() {
        if let Err(e) = state
            .store
            .merge_batch(batch.records.clone(), UpdateSource::Log)
            .await
        {
            warn!("Dropping log-derived records: {}", e);
        }
    }
    if batch.skipped > 0 {
        debug!("Skipped {} unparseable log lines", batch.skipped);
    }
    Ok(batch)
}

pub fn spawn_log_tailer(
    state: SharedState,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let source = LogSource::new(state.config.log_file.clone());
        info!("Log tailer started ({:?})", source);

        let mut tailer = LogTailer::new();
        let mut ticker = interval(state.config.log_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }

            if let Err(e) = tail_once(&state, &source, &mut tailer).await {
                warn!("Log tail failed: {}", e);
            }
        }
        info!("Log tailer stopped");
    })
}
