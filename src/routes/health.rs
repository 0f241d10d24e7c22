use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::{BackendStatus, SharedState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend_url: String,
    pub backend: BackendStatus,
    pub events_enabled: bool,
    pub tests_tracked: usize,
    pub logs_buffered: usize,
    pub report_loaded: bool,
    pub version: String,
}

/// Overall dashboard status from what is known about the backend.
pub fn determine_overall_status(
    backend_reachable: bool,
    stream_connected: bool,
    events_enabled: bool,
) -> &'static str {
    if !backend_reachable {
        "unreachable"
    } else if events_enabled && !stream_connected {
        "degraded"
    } else {
        "healthy"
    }
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let backend = state.backend_status.read().await.clone();
    let status = determine_overall_status(
        backend.reachable,
        backend.stream_connected,
        state.config.events_enabled,
    );

    Json(HealthResponse {
        status: status.to_string(),
        backend_url: state.config.backend_url.clone(),
        backend,
        events_enabled: state.config.events_enabled,
        tests_tracked: state.store.snapshot().len(),
        logs_buffered: state.logs.history().await.len(),
        report_loaded: state.report.read().await.is_some(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_when_reachable_and_streaming() {
        assert_eq!(determine_overall_status(true, true, true), "healthy");
    }

    #[test]
    fn test_healthy_on_polls_when_events_disabled() {
        assert_eq!(determine_overall_status(true, false, false), "healthy");
    }

    #[test]
    fn test_degraded_when_stream_down() {
        assert_eq!(determine_overall_status(true, false, true), "degraded");
    }

    #[test]
    fn test_unreachable_wins() {
        assert_eq!(determine_overall_status(false, true, true), "unreachable");
        assert_eq!(determine_overall_status(false, false, false), "unreachable");
    }

    #[test]
    fn test_health_response_serializes_to_json() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            backend_url: "http://localhost:8080".to_string(),
            backend: BackendStatus {
                reachable: true,
                ..Default::default()
            },
            events_enabled: true,
            tests_tracked: 2,
            logs_buffered: 0,
            report_loaded: false,
            version: "0.1.0".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["backend"]["reachable"], true);
        assert_eq!(json["tests_tracked"], 2);
    }
}
