use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(crate::routes::health::health))
        // Tests
        .route(
            "/api/tests",
            get(crate::routes::tests::list_tests).post(crate::routes::tests::start_test),
        )
        .route("/api/tests/stream", get(crate::routes::tests::test_stream))
        .route("/api/tests/stop", post(crate::routes::tests::stop_test))
        .route("/api/tests/{id}", delete(crate::routes::tests::delete_test))
        // Campaigns
        .route(
            "/api/campaigns",
            get(crate::routes::campaigns::list_campaigns)
                .post(crate::routes::campaigns::create_campaign),
        )
        .route(
            "/api/campaigns/{id}",
            put(crate::routes::campaigns::update_campaign),
        )
        // Logs
        .route("/logs/history", get(crate::routes::logs::log_history))
        .route("/logs/stream", get(crate::routes::logs::log_stream))
        .route("/api/progress", get(crate::routes::logs::progress))
        // Report
        .route(
            "/api/report",
            get(crate::routes::report::get_report).post(crate::routes::report::upload_report),
        )
        .route(
            "/api/report/histogram",
            get(crate::routes::report::report_histogram),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
