use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use mft_dashboard::config::DashboardConfig;
use mft_dashboard::log_capture::RawLogLine;
use mft_dashboard::server::build_router;
use mft_dashboard::state::{DashboardState, SharedState};

fn offline_dashboard() -> (SharedState, Router) {
    let state = DashboardState::shared(DashboardConfig::for_backend("http://127.0.0.1:9")).unwrap();
    let router = build_router(state.clone());
    (state, router)
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn valid_report(host: &str) -> Value {
    json!({
        "config": {
            "Protocol": "SFTP", "Type": "upload", "Host": host, "Port": 22,
            "FilesizePolicies": [
                {"Size": "512", "Unit": "KB", "Percent": 70},
                {"Size": 2, "Unit": "MB", "Percent": 30}
            ]
        },
        "summary": {
            "total_requests": 6, "successful_requests": 5, "failed_requests": 1,
            "avg_latency_ms": 41.67, "min_latency_ms": 10, "max_latency_ms": 100,
            "avg_throughput_mbps": 0.5, "peak_throughput_mbps": 1.5
        },
        "latencies": [10, 20, 30, 40, 50, 100],
        "throughputs": [0.4, 0.6],
        "errors": {"connection reset": 1},
        "timestamp": "2024-05-01T12:00:00Z"
    })
}

#[tokio::test]
async fn test_report_absent_until_uploaded() {
    let (_state, router) = offline_dashboard();
    let (status, body) = call(&router, get("/api/report")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("no report"));
}

#[tokio::test]
async fn test_upload_valid_report() {
    let (state, router) = offline_dashboard();

    let (status, body) = call(&router, post_json("/api/report", &valid_report("sftp.local"))).await;
    assert_eq!(status, StatusCode::OK);

    let analysis = &body["analysis"];
    assert_eq!(analysis["summary"]["host"], "sftp.local");
    assert!((analysis["summary"]["success_rate"].as_f64().unwrap() - 83.333).abs() < 0.01);
    assert_eq!(analysis["summary"]["avg_throughput"]["unit"], "KB/s");
    assert_eq!(analysis["summary"]["avg_throughput"]["value"], 512.0);
    assert_eq!(analysis["slowest_requests"][0]["latency_ms"], 100.0);
    assert_eq!(analysis["errors"][0]["kind"], "connection reset");
    assert!(state.report.read().await.is_some());
}

#[tokio::test]
async fn test_invalid_upload_names_fields_and_keeps_previous_report() {
    let (_state, router) = offline_dashboard();
    call(&router, post_json("/api/report", &valid_report("first.local"))).await;

    let mut broken = valid_report("second.local");
    broken.as_object_mut().unwrap().remove("summary");
    broken["config"].as_object_mut().unwrap().remove("Host");
    let (status, body) = call(&router, post_json("/api/report", &broken)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let fields: Vec<&str> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f.as_str().unwrap())
        .collect();
    assert!(fields.contains(&"summary"));
    assert!(fields.contains(&"config.Host"));

    let (status, body) = call(&router, get("/api/report")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["analysis"]["summary"]["host"], "first.local");
}

#[tokio::test]
async fn test_upload_rejects_non_json() {
    let (state, router) = offline_dashboard();
    let request = Request::builder()
        .method("POST")
        .uri("/api/report")
        .body(Body::from("definitely not json"))
        .unwrap();
    let (status, body) = call(&router, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body.get("fields").is_none());
    assert!(state.report.read().await.is_none());
}

#[tokio::test]
async fn test_histogram_resolution() {
    let (_state, router) = offline_dashboard();
    call(&router, post_json("/api/report", &valid_report("h"))).await;

    let (status, body) = call(&router, get("/api/report/histogram?bins=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bin_width"], 18.0);
    let counts: Vec<u64> = body["bins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["count"].as_u64().unwrap())
        .collect();
    assert_eq!(counts, vec![2, 2, 1, 0, 1]);

    let (status, _) = call(&router, get("/api/report/histogram?bins=100000")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reports_unreachable_backend() {
    let (_state, router) = offline_dashboard();
    let (status, body) = call(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unreachable");
    assert_eq!(body["tests_tracked"], 0);
    assert_eq!(body["report_loaded"], false);
}

#[tokio::test]
async fn test_log_history_limit_keeps_newest() {
    let (state, router) = offline_dashboard();
    let lines = (1..=10)
        .map(|line| RawLogLine {
            line,
            timestamp: None,
            message: format!("line {}", line),
        })
        .collect();
    state.logs.extend(lines).await;

    let (status, body) = call(&router, get("/logs/history?limit=3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 10);
    let messages: Vec<&str> = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["message"].as_str().unwrap())
        .collect();
    assert_eq!(messages, vec!["line 10", "line 9", "line 8"]);
}

#[tokio::test]
async fn test_invalid_campaign_rejected_locally() {
    let (_state, router) = offline_dashboard();
    let campaign = json!({
        "name": "nightly", "Protocol": "FTP", "Type": "upload",
        "Hostname": "ftp.local", "Port": 21, "Timeout": 30,
        "FilesizePolicies": [{"Size": 1, "Unit": "MB", "Percent": 60}]
    });
    let (status, body) = call(&router, post_json("/api/campaigns", &campaign)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["problems"][0]
        .as_str()
        .unwrap()
        .contains("must sum to 100"));
}

#[tokio::test]
async fn test_test_list_starts_empty() {
    let (_state, router) = offline_dashboard();
    let (status, body) = call(&router, get("/api/tests")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
    assert_eq!(body["tests"], json!([]));
}
