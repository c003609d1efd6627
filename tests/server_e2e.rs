//! End-to-end tests for the HTTP surface and job lifecycle.
//!
//! These tests run a real server bound to an ephemeral port, backed by a
//! temp-dir SQLite store, the mock LLM, and a stub target.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use gostwriter::api::{build_router, AppState};
use gostwriter::config::MockLlmConfig;
use gostwriter::jobs::{JobStore, Queue, SqliteJobStore, Stage};
use gostwriter::llm::MockClient;
use gostwriter::processor::{CallbackPolicy, TranscriptionProcessor};
use gostwriter::storage::Uploader;
use gostwriter::targets::{PostOutcome, PostRequest, Registry, Target};
use gostwriter::{Error, Result};

const TARGET_NAME: &str = "docs-main";

/// Records every post and returns a fixed outcome.
struct RecordingTarget {
    posts: Arc<Mutex<Vec<PostRequest>>>,
}

#[async_trait]
impl Target for RecordingTarget {
    fn name(&self) -> &str {
        TARGET_NAME
    }

    async fn post(&self, _cancel: &CancellationToken, req: &PostRequest) -> Result<PostOutcome> {
        self.posts.lock().unwrap().push(req.clone());
        Ok(PostOutcome {
            target_name: TARGET_NAME.to_string(),
            location: "git:loc".to_string(),
            commit: "deadbeef".to_string(),
        })
    }
}

struct ServerOptions {
    api_key: String,
    queue_capacity: usize,
    worker_count: usize,
    mock_delay: Duration,
    callback: CallbackPolicy,
    max_upload_size: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            queue_capacity: 8,
            worker_count: 2,
            mock_delay: Duration::ZERO,
            callback: CallbackPolicy {
                retries: 3,
                backoff: Duration::from_millis(10),
            },
            max_upload_size: 1024 * 1024,
        }
    }
}

struct TestServer {
    base_url: String,
    store: Arc<SqliteJobStore>,
    posts: Arc<Mutex<Vec<PostRequest>>>,
    queue: Arc<Queue>,
    _dir: TempDir,
}

async fn start_server(opts: ServerOptions) -> TestServer {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteJobStore::open(dir.path().join("jobs.db"))
            .await
            .unwrap(),
    );
    let uploader = Arc::new(Uploader::new(dir.path()));

    let posts = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry.add(Arc::new(RecordingTarget {
        posts: posts.clone(),
    }));

    let llm = Arc::new(MockClient::new(MockLlmConfig {
        delay: opts.mock_delay.into(),
        prefix: "Transcribed by Mock".to_string(),
    }));

    let processor = Arc::new(TranscriptionProcessor::new(
        store.clone(),
        llm,
        Arc::new(registry),
        opts.callback,
    ));

    let queue = Arc::new(Queue::new(opts.queue_capacity, opts.worker_count));
    queue.start(processor.clone()).unwrap();

    let state = AppState {
        store: store.clone(),
        queue: queue.clone(),
        uploader,
        processor,
        target_name: TARGET_NAME.to_string(),
        api_key: opts.api_key,
        max_upload_size: opts.max_upload_size,
    };
    let router = build_router(state, Duration::from_secs(60));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        store,
        posts,
        queue,
        _dir: dir,
    }
}

fn image_form(bytes: &[u8], filename: &str, mime: &str) -> reqwest::multipart::Form {
    let part = reqwest::multipart::Part::bytes(bytes.to_vec())
        .file_name(filename.to_string())
        .mime_str(mime)
        .unwrap();
    reqwest::multipart::Form::new().part("file", part)
}

async fn wait_for_stage(store: &SqliteJobStore, id: &str, stage: Stage) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = store.get_job(id).await.unwrap() {
            if job.stage == stage {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "job {id} did not reach {stage} in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Stub callback receiver returning a scripted sequence of status codes
/// (200 once the script is exhausted).
struct CallbackStub {
    url: String,
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[derive(Clone)]
struct CallbackStubState {
    received: Arc<Mutex<Vec<serde_json::Value>>>,
    responses: Arc<Mutex<VecDeque<u16>>>,
}

async fn start_callback_stub(scripted: Vec<u16>) -> CallbackStub {
    let state = CallbackStubState {
        received: Arc::new(Mutex::new(Vec::new())),
        responses: Arc::new(Mutex::new(scripted.into_iter().collect())),
    };

    async fn receive(
        State(state): State<CallbackStubState>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        state.received.lock().unwrap().push(body);
        let code = state
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(200);
        StatusCode::from_u16(code).unwrap()
    }

    let router = Router::new()
        .route("/callback", post(receive))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    CallbackStub {
        url: format!("http://{addr}/callback"),
        received: state.received,
    }
}

#[tokio::test]
async fn healthz_returns_ok() {
    let server = start_server(ServerOptions::default()).await;
    let res = reqwest::get(format!("{}/healthz", server.base_url))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"status": "ok"}));
}

#[tokio::test]
async fn sync_happy_path_completes_job() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.bytes().await.unwrap().is_empty());

    let posts = server.posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    let job_id = posts[0].job_id.clone();
    drop(posts);

    let job = server.store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.stage, Stage::Completed);
    assert_eq!(job.target_location.as_deref(), Some("git:loc"));
    assert_eq!(job.target_commit.as_deref(), Some("deadbeef"));
    assert!(job.started_at.is_some());
    assert!(job.completed_at.unwrap() >= job.created_at);
}

#[tokio::test]
async fn async_happy_path_polls_to_completed() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .header("Prefer", "RESPOND-ASYNC")
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);
    let body: serde_json::Value = res.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(
        body["status_url"].as_str().unwrap(),
        format!("/v1/transcriptions/{job_id}")
    );

    wait_for_stage(&server.store, &job_id, Stage::Completed).await;

    let res = client
        .get(format!("{}/v1/transcriptions/{job_id}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let status: serde_json::Value = res.json().await.unwrap();
    assert_eq!(status["stage"], "completed");
    assert_eq!(status["error"], serde_json::Value::Null);
    assert_eq!(status["target_result"]["location"], "git:loc");
    assert_eq!(status["target_result"]["commit"], "deadbeef");
}

#[tokio::test]
async fn api_key_gate_enforced_when_configured() {
    let server = start_server(ServerOptions {
        api_key: "key123".to_string(),
        ..Default::default()
    })
    .await;
    let client = reqwest::Client::new();
    let url = format!("{}/v1/transcriptions", server.base_url);

    let res = client
        .post(&url)
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .post(&url)
        .header("X-API-Key", "wrong")
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .post(&url)
        .header("X-API-Key", "key123")
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn unsupported_media_type_is_rejected() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(image_form(b"hello", "notes.txt", "text/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn missing_file_field_is_rejected() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().text("title", "no file");
    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn invalid_callback_url_is_rejected() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let form = image_form(b"abc", "img.png", "image/png").text("callback_url", "not a url");
    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn invalid_metadata_json_is_rejected() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let form = image_form(b"abc", "img.png", "image/png").text("metadata", "{not json");
    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn queue_full_returns_503() {
    let server = start_server(ServerOptions {
        queue_capacity: 1,
        worker_count: 1,
        mock_delay: Duration::from_secs(10),
        ..Default::default()
    })
    .await;
    let client = reqwest::Client::new();
    let url = format!("{}/v1/transcriptions", server.base_url);

    // First request occupies the single worker, second fills the buffer.
    for expected in [202, 202] {
        let res = client
            .post(&url)
            .header("Prefer", "respond-async")
            .multipart(image_form(b"abc", "img.png", "image/png"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), expected);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let res = client
        .post(&url)
        .header("Prefer", "respond-async")
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 503);

    server.queue.shutdown(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn upload_size_boundary_is_inclusive() {
    let server = start_server(ServerOptions {
        max_upload_size: 128,
        ..Default::default()
    })
    .await;
    let client = reqwest::Client::new();
    let url = format!("{}/v1/transcriptions", server.base_url);

    let exact = vec![0u8; 128];
    let res = client
        .post(&url)
        .multipart(image_form(&exact, "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let over = vec![0u8; 129];
    let res = client
        .post(&url)
        .multipart(image_form(&over, "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
}

#[tokio::test]
async fn unknown_job_id_returns_404() {
    let server = start_server(ServerOptions::default()).await;
    let res = reqwest::get(format!(
        "{}/v1/transcriptions/00000000-0000-4000-8000-000000000000",
        server.base_url
    ))
    .await
    .unwrap();
    assert_eq!(res.status(), 404);

    // Identifier outside the accepted character set is also a 404.
    let res = reqwest::get(format!("{}/v1/transcriptions/NOPE", server.base_url))
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn callback_is_delivered_once_on_success() {
    let stub = start_callback_stub(vec![]).await;
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let form = image_form(b"abc", "img.png", "image/png").text("callback_url", stub.url.clone());
    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let received = stub.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["status"], "completed");
    assert_eq!(received[0]["stage"], "completed");
    assert_eq!(received[0]["error"], serde_json::Value::Null);
    assert_eq!(received[0]["result"]["commit"], "deadbeef");
    assert_eq!(received[0]["result"]["target"], TARGET_NAME);
}

#[tokio::test]
async fn callback_retries_with_linear_backoff() {
    let stub = start_callback_stub(vec![500, 500]).await;
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let form = image_form(b"abc", "img.png", "image/png").text("callback_url", stub.url.clone());
    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let elapsed = started.elapsed();

    let received = stub.received.lock().unwrap();
    assert_eq!(received.len(), 3, "two failures then one success");
    // Sleeps of 1×10ms and 2×10ms separate the attempts.
    assert!(
        elapsed >= Duration::from_millis(30),
        "attempts were not spaced: {elapsed:?}"
    );
}

#[tokio::test]
async fn job_record_round_trips_optional_fields() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let form = image_form(b"abc", "img.png", "image/png")
        .text("title", "  Quarterly Report  ")
        .text("metadata", r#"{"source":"scanner","pages":2}"#);
    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let posts = server.posts.lock().unwrap();
    let req = posts.last().unwrap().clone();
    drop(posts);

    // Title is trimmed and prepended as a level-one heading.
    assert_eq!(req.suggested_title.as_deref(), Some("Quarterly Report"));
    assert!(req.markdown.starts_with("# Quarterly Report\n\n"));

    let job = server.store.get_job(&req.job_id).await.unwrap().unwrap();
    assert_eq!(job.title.as_deref(), Some("Quarterly Report"));
    let meta = job.metadata.unwrap();
    assert_eq!(meta["source"], "scanner");
    assert_eq!(meta["pages"], 2);
}

#[tokio::test]
async fn staged_upload_is_removed_after_async_processing() {
    let server = start_server(ServerOptions::default()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .header("Prefer", "respond-async")
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);
    let body: serde_json::Value = res.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    wait_for_stage(&server.store, &job_id, Stage::Completed).await;
    // The worker invoked the cleanup handle after processing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = server.store.get_job(&job_id).await.unwrap().unwrap();
    assert!(!std::path::Path::new(&job.image_path).exists());
}

#[tokio::test]
async fn enqueue_after_shutdown_is_rejected() {
    let server = start_server(ServerOptions::default()).await;
    server.queue.shutdown(Duration::from_secs(1)).await;

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/v1/transcriptions", server.base_url))
        .header("Prefer", "respond-async")
        .multipart(image_form(b"abc", "img.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 500);
}

#[tokio::test]
async fn queue_error_kinds_are_distinct() {
    let queue = Queue::new(1, 1);
    let err = queue
        .enqueue(gostwriter::jobs::model::WorkItem::new(
            gostwriter::jobs::model::Job::new("x", "/tmp/x.png", "image/png", TARGET_NAME),
            None,
        ))
        .unwrap_err();
    assert!(matches!(err, Error::QueueNotStarted));
}
