use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;

use crate::error::DashboardError;
use crate::model::Campaign;
use crate::state::SharedState;

/// GET /api/campaigns — campaign names known to the backend.
pub async fn list_campaigns(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, DashboardError> {
    let campaigns = state.backend.list_campaigns().await?;
    Ok(Json(serde_json::json!({ "campaigns": campaigns })))
}

/// POST /api/campaigns
pub async fn create_campaign(
    State(state): State<SharedState>,
    Json(campaign): Json<Campaign>,
) -> Result<impl IntoResponse, DashboardError> {
    check(&campaign)?;
    state.backend.create_campaign(&campaign).await?;
    info!("Created campaign {}", campaign.name);
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "name": campaign.name })),
    ))
}

/// PUT /api/campaigns/{id}
pub async fn update_campaign(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(campaign): Json<Campaign>,
) -> Result<impl IntoResponse, DashboardError> {
    check(&campaign)?;
    state.backend.update_campaign(&id, &campaign).await?;
    info!("Updated campaign {}", id);
    Ok(Json(serde_json::json!({ "name": campaign.name })))
}

fn check(campaign: &Campaign) -> Result<(), DashboardError> {
    let problems = campaign.problems();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DashboardError::InvalidRequest(problems))
    }
}
