use crate::backend::BackendClient;
use crate::config::DashboardConfig;
use crate::error::DashboardError;
use crate::log_capture::LogState;
use crate::log_tailer::LiveProgress;
use crate::metrics::ReportAnalysis;
use crate::report::ReportDocument;
use crate::store::{StoreHandle, TestStateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

pub type SharedState = Arc<DashboardState>;

pub struct DashboardState {
    pub config: DashboardConfig,
    pub store: StoreHandle,
    pub backend: BackendClient,
    pub logs: LogState,
    pub progress: RwLock<LiveProgress>,
    pub backend_status: RwLock<BackendStatus>,
    pub report: RwLock<Option<LoadedReport>>,
    /// Wakes the history poller ahead of its next tick.
    pub poll_notify: Notify,
}

/// What the dashboard currently knows about its backend.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub reachable: bool,
    pub last_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub stream_connected: bool,
}

/// The report currently on display.
#[derive(Debug, Clone)]
pub struct LoadedReport {
    pub document: Arc<ReportDocument>,
    pub analysis: ReportAnalysis,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedReport {
    pub fn new(document: ReportDocument) -> Self {
        let analysis = crate::metrics::analyze(&document);
        Self {
            document: Arc::new(document),
            analysis,
            loaded_at: Utc::now(),
        }
    }
}

impl DashboardState {
    /// Build the state and spawn the store task. Must run inside a Tokio runtime.
    pub fn new(config: DashboardConfig) -> Result<Self, DashboardError> {
        let backend = BackendClient::new(&config.backend_url)?;
        let (store, _store_task) = StoreHandle::spawn(TestStateStore::new());
        Ok(Self {
            config,
            store,
            backend,
            logs: LogState::new(),
            progress: RwLock::new(LiveProgress::default()),
            backend_status: RwLock::new(BackendStatus::default()),
            report: RwLock::new(None),
            poll_notify: Notify::new(),
        })
    }

    pub fn shared(config: DashboardConfig) -> Result<SharedState, DashboardError> {
        Ok(Arc::new(Self::new(config)?))
    }

    /// Ask the history poller to refresh now.
    pub fn request_poll(&self) {
        self.poll_notify.notify_one();
    }
}
