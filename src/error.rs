use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::backend::BackendError;
use crate::report::ReportError;
use crate::store::StoreClosed;

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid report: {0}")]
    InvalidReport(#[from] ReportError),

    #[error("Invalid request: {}", .0.join("; "))]
    InvalidRequest(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Test state store is not running")]
    StoreClosed(#[from] StoreClosed),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DashboardError {
    pub fn invalid(problem: impl Into<String>) -> Self {
        DashboardError::InvalidRequest(vec![problem.into()])
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DashboardError::Backend(_) => StatusCode::BAD_GATEWAY,
            DashboardError::InvalidReport(ReportError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            DashboardError::InvalidReport(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DashboardError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DashboardError::NotFound(_) => StatusCode::NOT_FOUND,
            DashboardError::StoreClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            DashboardError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut body = serde_json::json!({
            "error": self.to_string(),
        });
        match &self {
            DashboardError::InvalidReport(e) if !e.fields().is_empty() => {
                body["fields"] = serde_json::json!(e.fields());
            }
            DashboardError::InvalidRequest(problems) => {
                body["problems"] = serde_json::json!(problems);
            }
            _ => {}
        }

        (status, axum::Json(body)).into_response()
    }
}
