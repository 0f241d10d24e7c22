use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::DEFAULT_HISTOGRAM_BINS;
use crate::error::DashboardError;
use crate::metrics::histogram;
use crate::report::parse_report;
use crate::state::{LoadedReport, SharedState};

const MAX_HISTOGRAM_BINS: usize = 500;

/// POST /api/report — validate and load a report. On failure the previously
/// loaded report stays on display.
pub async fn upload_report(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, DashboardError> {
    let document = parse_report(&body).inspect_err(|e| warn!("Rejected report: {}", e))?;
    let loaded = LoadedReport::new(document);
    info!(
        "Loaded report for {}:{} ({} latencies)",
        loaded.document.config.host,
        loaded.document.config.port,
        loaded.document.latencies.len()
    );

    let body = report_json(&loaded);
    *state.report.write().await = Some(loaded);
    Ok(Json(body))
}

/// GET /api/report — analysis of the loaded report.
pub async fn get_report(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, DashboardError> {
    let report = state.report.read().await;
    let loaded = report
        .as_ref()
        .ok_or_else(|| DashboardError::NotFound("no report loaded".to_string()))?;
    Ok(Json(report_json(loaded)))
}

#[derive(Deserialize)]
pub struct HistogramQuery {
    #[serde(default = "default_bins")]
    pub bins: usize,
}

fn default_bins() -> usize {
    DEFAULT_HISTOGRAM_BINS
}

/// GET /api/report/histogram?bins=N — latency histogram at a chosen resolution.
pub async fn report_histogram(
    State(state): State<SharedState>,
    Query(query): Query<HistogramQuery>,
) -> Result<impl IntoResponse, DashboardError> {
    if query.bins > MAX_HISTOGRAM_BINS {
        return Err(DashboardError::invalid(format!(
            "bins must be at most {}",
            MAX_HISTOGRAM_BINS
        )));
    }
    let report = state.report.read().await;
    let loaded = report
        .as_ref()
        .ok_or_else(|| DashboardError::NotFound("no report loaded".to_string()))?;
    Ok(Json(histogram(&loaded.document.latencies, query.bins)))
}

fn report_json(loaded: &LoadedReport) -> serde_json::Value {
    serde_json::json!({
        "loadedAt": loaded.loaded_at.to_rfc3339(),
        "analysis": loaded.analysis,
    })
}
