use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use mft_dashboard::config::{DashboardConfig, ReconnectPolicy};
use mft_dashboard::event_ingestor::spawn_event_ingestor;
use mft_dashboard::history_poller::poll_once;
use mft_dashboard::log_tailer::{tail_once, LogSource, LogTailer};
use mft_dashboard::model::{TestRecord, TestStatus};
use mft_dashboard::producer::ProducerHandle;
use mft_dashboard::server::build_router;
use mft_dashboard::state::{DashboardState, SharedState};

// --- Fake MFT backend ---

#[derive(Default)]
struct FakeBackend {
    history: Mutex<Vec<Value>>,
    fail_history: AtomicBool,
    events: Mutex<String>,
    log: Mutex<String>,
    started: Mutex<Vec<Value>>,
    deleted: Mutex<Vec<String>>,
    stopped: AtomicBool,
}

type Fake = Arc<FakeBackend>;

async fn history(State(fake): State<Fake>) -> Response {
    if fake.fail_history.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "database offline").into_response();
    }
    let history = fake.history.lock().unwrap().clone();
    Json(history).into_response()
}

async fn events(State(fake): State<Fake>) -> impl IntoResponse {
    let body = fake.events.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn start(State(fake): State<Fake>, Json(body): Json<Value>) -> Json<Value> {
    fake.started.lock().unwrap().push(body);
    Json(json!({ "testId": "t-new" }))
}

async fn stop(State(fake): State<Fake>) -> StatusCode {
    fake.stopped.store(true, Ordering::SeqCst);
    StatusCode::OK
}

async fn remove(State(fake): State<Fake>, Path(id): Path<String>) -> StatusCode {
    if id == "missing" {
        return StatusCode::NOT_FOUND;
    }
    fake.deleted.lock().unwrap().push(id);
    StatusCode::NO_CONTENT
}

async fn latest_log(State(fake): State<Fake>) -> String {
    fake.log.lock().unwrap().clone()
}

async fn campaigns() -> Json<Value> {
    Json(json!(["nightly", "smoke"]))
}

async fn spawn_backend() -> (Fake, String) {
    let fake = Fake::default();
    let app = Router::new()
        .route("/api/tests/history", get(history))
        .route("/api/tests", post(start))
        .route("/api/tests/{id}", delete(remove))
        .route("/api/test/stop", post(stop))
        .route("/api/events", get(events))
        .route("/api/campaigns", get(campaigns))
        .route("/logs/latest.log", get(latest_log))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (fake, format!("http://{}", addr))
}

fn dashboard(backend_url: &str) -> SharedState {
    let mut config = DashboardConfig::for_backend(backend_url);
    config.reconnect = ReconnectPolicy {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(50),
        max_attempts: 2,
    };
    DashboardState::shared(config).unwrap()
}

fn record(state: &SharedState, test_id: &str) -> Option<TestRecord> {
    state
        .store
        .snapshot()
        .iter()
        .find(|r| r.test_id == test_id)
        .cloned()
}

async fn wait_for(state: &SharedState, condition: impl Fn(&[TestRecord]) -> bool) {
    let mut rx = state.store.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition(rx.borrow_and_update().as_slice()) {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("store never reached the expected state");
}

async fn send(state: &SharedState, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// --- History polling ---

#[tokio::test]
async fn test_poll_merges_history() {
    let (fake, url) = spawn_backend().await;
    *fake.history.lock().unwrap() = vec![
        json!({"testId": "t1", "campaign": "nightly", "status": "completed", "success": 10, "failures": 0}),
        json!({"testId": "t2", "status": "running", "date": "2024-05-01T12:00:00Z"}),
    ];
    let state = dashboard(&url);

    let changed = poll_once(&state).await.unwrap();
    assert_eq!(changed, 2);

    let t1 = record(&state, "t1").unwrap();
    assert_eq!(t1.status, TestStatus::Completed);
    assert_eq!(t1.campaign, "nightly");
    assert_eq!(t1.success, 10);
    assert!(record(&state, "t2").unwrap().timestamp.is_some());

    let status = state.backend_status.read().await;
    assert!(status.reachable);
    assert!(status.last_poll_at.is_some());
}

#[tokio::test]
async fn test_failed_poll_keeps_last_known_state() {
    let (fake, url) = spawn_backend().await;
    *fake.history.lock().unwrap() = vec![json!({"testId": "t1", "status": "running"})];
    let state = dashboard(&url);
    poll_once(&state).await.unwrap();

    fake.fail_history.store(true, Ordering::SeqCst);
    assert!(poll_once(&state).await.is_err());

    assert_eq!(record(&state, "t1").unwrap().status, TestStatus::Running);
    let status = state.backend_status.read().await;
    assert!(!status.reachable);
    assert!(status.last_error.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn test_poll_skips_malformed_records() {
    let (fake, url) = spawn_backend().await;
    *fake.history.lock().unwrap() = vec![
        json!({"testId": "good", "status": "completed", "success": 10}),
        json!({"testId": "odd", "status": "stopped"}),
        json!({"testId": "frac", "failures": 0.5}),
        json!({"status": "running"}),
    ];
    let state = dashboard(&url);

    let changed = poll_once(&state).await.unwrap();
    assert_eq!(changed, 1);

    let snapshot = state.store.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].test_id, "good");
    assert_eq!(snapshot[0].status, TestStatus::Completed);
    assert_eq!(snapshot[0].success, 10);

    let status = state.backend_status.read().await;
    assert!(status.reachable);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_unreachable_backend_leaves_store_empty() {
    let state = dashboard("http://127.0.0.1:9");
    assert!(poll_once(&state).await.is_err());
    assert!(state.store.snapshot().is_empty());
    assert!(!state.backend_status.read().await.reachable);
}

// --- Event stream ---

#[tokio::test]
async fn test_event_stream_drives_store_and_poll_cannot_regress() {
    let (fake, url) = spawn_backend().await;
    *fake.events.lock().unwrap() = concat!(
        ": hello\n\n",
        "data: {\"type\":\"status\",\"payload\":{\"testId\":\"t1\",\"status\":\"running\",\"success\":1}}\n\n",
        "data: not json\n\n",
        "event: status\n",
        "data: {\"type\":\"status\",\"payload\":{\"testId\":\"t1\",\"status\":\"completed\",\"success\":10,\"failures\":0}}\n\n",
    )
    .to_string();
    let state = dashboard(&url);

    let s = state.clone();
    let mut ingestor = ProducerHandle::spawn("event_ingestor", move |stop| {
        spawn_event_ingestor(s, stop)
    });
    wait_for(&state, |tests| {
        tests
            .iter()
            .any(|r| r.test_id == "t1" && r.status == TestStatus::Completed)
    })
    .await;
    ingestor.stop().await;
    assert!(!state.backend_status.read().await.stream_connected);

    // A stale poll arriving after completion does not reopen the test.
    *fake.history.lock().unwrap() = vec![json!({"testId": "t1", "status": "running"})];
    poll_once(&state).await.unwrap();

    let t1 = record(&state, "t1").unwrap();
    assert_eq!(t1.status, TestStatus::Completed);
    assert_eq!(t1.success, 10);
}

#[tokio::test]
async fn test_event_ingestor_gives_up_after_bounded_retries() {
    let state = dashboard("http://127.0.0.1:9");
    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let task = spawn_event_ingestor(state.clone(), stop_rx);
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("ingestor kept retrying")
        .unwrap();
    assert!(!state.backend_status.read().await.stream_connected);
}

#[tokio::test]
async fn test_event_ingestor_gives_up_on_streams_that_close_empty() {
    let (fake, url) = spawn_backend().await;
    // Connects fine, then ends without delivering a message.
    *fake.events.lock().unwrap() = ": ping\n\n".to_string();
    let state = dashboard(&url);
    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let task = spawn_event_ingestor(state.clone(), stop_rx);
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("ingestor reconnected forever to an empty stream")
        .unwrap();
    assert!(!state.backend_status.read().await.stream_connected);
}

// --- Log tailing from the backend ---

#[tokio::test]
async fn test_tail_backend_log() {
    let (fake, url) = spawn_backend().await;
    *fake.log.lock().unwrap() = concat!(
        "{\"type\":\"testStart\",\"testId\":\"t9\",\"campaign\":\"smoke\",\"numClients\":2,\"numRequests\":20}\n",
        "{\"type\":\"log\",\"message\":\"worker 1 connected\"}\n",
        "{\"type\":\"status\",\"progress\":40,\"success\":8,\"failures\":0}\n",
    )
    .to_string();
    let state = dashboard(&url);
    let mut tailer = LogTailer::new();

    tail_once(&state, &LogSource::Backend, &mut tailer).await.unwrap();

    let t9 = record(&state, "t9").unwrap();
    assert_eq!(t9.status, TestStatus::Running);
    assert_eq!(t9.num_clients, 2);

    let logs = state.logs.history().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "worker 1 connected");
    assert_eq!(state.progress.read().await.progress, 40.0);

    fake.log.lock().unwrap().push_str(
        "{\"type\":\"result\",\"testId\":\"t9\",\"success\":20,\"failures\":0,\"duration\":3.5}\n",
    );
    tail_once(&state, &LogSource::Backend, &mut tailer).await.unwrap();
    let t9 = record(&state, "t9").unwrap();
    assert_eq!(t9.status, TestStatus::Completed);
    assert_eq!(t9.success, 20);
    assert_eq!(state.logs.history().await.len(), 1);
}

// --- Dashboard routes that call the backend ---

#[tokio::test]
async fn test_start_test_tracks_queued_record() {
    let (fake, url) = spawn_backend().await;
    let state = dashboard(&url);

    let request = Request::builder()
        .method("POST")
        .uri("/api/tests")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"campaign": "nightly", "workers": 4, "requests": 100}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["testId"], "t-new");
    assert_eq!(fake.started.lock().unwrap().len(), 1);

    let queued = record(&state, "t-new").unwrap();
    assert_eq!(queued.status, TestStatus::Queued);
    assert_eq!(queued.campaign, "nightly");
    assert_eq!(queued.num_requests, 100);
}

#[tokio::test]
async fn test_invalid_start_request_never_reaches_backend() {
    let (fake, url) = spawn_backend().await;
    let state = dashboard(&url);

    let request = Request::builder()
        .method("POST")
        .uri("/api/tests")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"campaign": "", "workers": 0, "requests": 10}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["problems"].as_array().unwrap().len(), 2);
    assert!(fake.started.lock().unwrap().is_empty());
    assert!(state.store.snapshot().is_empty());
}

#[tokio::test]
async fn test_delete_removes_record_after_backend_confirms() {
    let (fake, url) = spawn_backend().await;
    *fake.history.lock().unwrap() = vec![
        json!({"testId": "t1", "status": "completed"}),
        json!({"testId": "missing", "status": "failed"}),
    ];
    let state = dashboard(&url);
    poll_once(&state).await.unwrap();
    fake.history.lock().unwrap().clear();

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/tests/t1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["wasTracked"], true);
    assert!(record(&state, "t1").is_none());
    assert_eq!(fake.deleted.lock().unwrap().as_slice(), ["t1".to_string()]);

    // Backend refuses: the local record stays.
    let request = Request::builder()
        .method("DELETE")
        .uri("/api/tests/missing")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(record(&state, "missing").is_some());
}

#[tokio::test]
async fn test_stop_and_campaign_listing() {
    let (fake, url) = spawn_backend().await;
    let state = dashboard(&url);

    let request = Request::builder()
        .method("POST")
        .uri("/api/tests/stop")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(fake.stopped.load(Ordering::SeqCst));

    let request = Request::builder()
        .uri("/api/campaigns")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["campaigns"], json!(["nightly", "smoke"]));
}
