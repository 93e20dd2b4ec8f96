#![allow(dead_code)] // Test helpers appear unused when compiled independently

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use functions_e2e::fixture::{Resources, StorageFixture};
use functions_e2e::host::{LogBuffer, LogSink, LogView};
use functions_e2e::invoke::FunctionInvoker;
use functions_e2e::scenarios::{functions, Harness};
use functions_e2e::storage::{MemoryStorage, StorageBackend};
use functions_e2e::RetryPolicy;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WORKER_TICK: Duration = Duration::from_millis(20);

/// Short enough to keep failing tests quick, long enough for the fake host.
pub fn test_policy() -> RetryPolicy {
    RetryPolicy::from_millis(5000, 25).unwrap()
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

#[derive(Clone)]
struct FakeState {
    storage: Arc<MemoryStorage>,
    resources: Resources,
    sink: Arc<LogSink>,
    invocations: Arc<AtomicU64>,
    queue_trigger_fails: Arc<AtomicBool>,
}

impl FakeState {
    fn next_id(&self) -> u64 {
        self.invocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn log(&self, line: String) {
        self.sink.push(line).await;
    }

    async fn executing(&self, function: &str, reason: &str) -> u64 {
        let id = self.next_id();
        self.log(format!(
            "Executing 'Functions.{function}' (Reason='{reason}', Id={id})"
        ))
        .await;
        id
    }

    async fn executed(&self, function: &str, id: u64) {
        self.log(format!(
            "{}, Id={id}, Duration=1ms)",
            functions::executed_line(function)
        ))
        .await;
    }

    async fn failed(&self, function: &str, id: u64) {
        self.log(format!(
            "Executed 'Functions.{function}' (Failed, Id={id}, Duration=1ms)"
        ))
        .await;
    }
}

/// In-process stand-in for the function host: HTTP triggers served by axum,
/// queue and blob triggers by a worker polling [`MemoryStorage`].
pub struct FakeHost {
    pub base_url: String,
    state: FakeState,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl FakeHost {
    /// Queue trigger invocations still copy their message but end with a
    /// `Failed` line.
    pub fn fail_queue_trigger(&self) {
        self.state.queue_trigger_fails.store(true, Ordering::Relaxed);
    }

    /// Write a line into the host log as if the host printed it.
    pub async fn log(&self, line: impl Into<String>) {
        self.state.log(line.into()).await;
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub async fn spawn_fake_host(
    storage: Arc<MemoryStorage>,
    resources: Resources,
    sink: LogSink,
) -> FakeHost {
    let state = FakeState {
        storage,
        resources,
        sink: Arc::new(sink),
        invocations: Arc::new(AtomicU64::new(0)),
        queue_trigger_fails: Arc::new(AtomicBool::new(false)),
    };
    state.log("Host started".to_string()).await;

    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .route(
            &format!("/api/{}", functions::HTTP_TRIGGER),
            get(http_trigger),
        )
        .route(
            &format!("/api/{}", functions::HTTP_QUEUE_OUTPUT),
            get(http_queue_output),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind fake host listener");
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await });
        if let Err(err) = server.await {
            eprintln!("fake host server error: {}", err);
        }
    });
    let worker = tokio::spawn(run_worker(state.clone(), cancel.clone()));
    state.log("Host lock lease acquired".to_string()).await;

    FakeHost {
        base_url,
        state,
        cancel,
        handles: vec![server, worker],
    }
}

async fn http_trigger(
    State(state): State<FakeState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let id = state
        .executing(functions::HTTP_TRIGGER, "This function was programmatically called")
        .await;
    let response = match params.get("name") {
        Some(name) if !name.is_empty() => (StatusCode::OK, format!("Hello, {name}")),
        _ => (
            StatusCode::BAD_REQUEST,
            "Please pass a name on the query string".to_string(),
        ),
    };
    state.executed(functions::HTTP_TRIGGER, id).await;
    response
}

async fn http_queue_output(
    State(state): State<FakeState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let Some(name) = params.get("name").filter(|name| !name.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing name".to_string());
    };
    let id = state
        .executing(functions::HTTP_QUEUE_OUTPUT, "This function was programmatically called")
        .await;
    if let Err(e) = state
        .storage
        .insert_message(&state.resources.http_output_queue, name)
        .await
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    state.executed(functions::HTTP_QUEUE_OUTPUT, id).await;
    (StatusCode::OK, format!("Queued {name}"))
}

async fn run_worker(state: FakeState, cancel: CancellationToken) {
    let mut copied_blobs = HashSet::new();
    let mut pair_count = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(WORKER_TICK) => {}
        }
        // Queues may be missing around setup and teardown; treat that as idle.
        process_queue(&state).await;
        process_pairs(&state, &mut pair_count).await;
        process_blobs(&state, &mut copied_blobs).await;
    }
}

async fn process_queue(state: &FakeState) {
    let queue = &state.resources.input_queue;
    while let Ok(Some(message)) = state.storage.read_message(queue).await {
        let id = state
            .executing(
                functions::QUEUE_TRIGGER,
                &format!("New queue message detected on '{queue}'."),
            )
            .await;
        state
            .log(format!("Queue trigger processed: {message}"))
            .await;
        if state
            .storage
            .insert_message(&state.resources.output_queue, &message)
            .await
            .is_err()
        {
            continue;
        }
        if state.queue_trigger_fails.load(Ordering::Relaxed) {
            state.failed(functions::QUEUE_TRIGGER, id).await;
        } else {
            state.executed(functions::QUEUE_TRIGGER, id).await;
        }
    }
}

async fn process_pairs(state: &FakeState, count: &mut u64) {
    let queue = &state.resources.pair_input_queue;
    while let Ok(Some(message)) = state.storage.read_message(queue).await {
        let tag = *count % 2 + 1;
        *count += 1;
        let id = state
            .executing(
                functions::QUEUE_PAIR,
                &format!("New queue message detected on '{queue}'."),
            )
            .await;
        let _ = state
            .storage
            .insert_message(
                &state.resources.pair_output_queue,
                &format!("{message}|{tag}"),
            )
            .await;
        state.executed(functions::QUEUE_PAIR, id).await;
    }
}

async fn process_blobs(state: &FakeState, copied: &mut HashSet<String>) {
    let input = &state.resources.input_container;
    for name in state.storage.blob_names(input).await {
        if copied.contains(&name) {
            continue;
        }
        let Ok(Some(content)) = state.storage.download_blob(input, &name).await else {
            continue;
        };
        let id = state
            .executing(
                functions::BLOB_TRIGGER,
                &format!("New blob detected: {input}/{name}"),
            )
            .await;
        if state
            .storage
            .upload_blob(&state.resources.output_container, &name, content)
            .await
            .is_ok()
        {
            state.executed(functions::BLOB_TRIGGER, id).await;
            copied.insert(name);
        }
    }
}

/// A fixture over fresh [`MemoryStorage`], a running fake host and a harness
/// pointed at both.
pub struct TestEnv {
    pub memory: Arc<MemoryStorage>,
    pub fixture: StorageFixture,
    pub host: FakeHost,
    pub harness: Harness,
    pub logs: LogView,
}

impl TestEnv {
    pub async fn start(suffix: &str) -> Self {
        let memory = Arc::new(MemoryStorage::new());
        let resources = Resources::with_suffix(suffix);
        let fixture = StorageFixture::setup(memory.clone(), resources.clone(), &CancellationToken::new())
            .await
            .unwrap();

        let (sink, logs) = LogBuffer::new();
        let host = spawn_fake_host(memory.clone(), resources, sink).await;
        let invoker = FunctionInvoker::new(&host.base_url, Some("test-key".to_string())).unwrap();
        let harness = Harness::new(&fixture, invoker, logs.clone(), test_policy());

        Self {
            memory,
            fixture,
            host,
            harness,
            logs,
        }
    }

    pub async fn stop(self) {
        self.host.stop().await;
        self.fixture.teardown().await.unwrap();
    }
}
