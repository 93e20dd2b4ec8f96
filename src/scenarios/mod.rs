//! Trigger and binding scenarios: seed an input, let the host react, verify
//! the output.

mod blob;
mod http;
mod queue;

pub use http::invoke_expecting;

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::fixture::{Resources, StorageFixture};
use crate::host::LogView;
use crate::invoke::{FunctionInvoker, InvokeError};
use crate::poll::retry::RetryConfig;
use crate::poll::{wait_for_cancellable, PollError, RetryPolicy};
use crate::storage::{try_read_message, StorageBackend, StorageError};

/// Functions the app under test is expected to expose.
pub mod functions {
    pub const QUEUE_TRIGGER: &str = "QueueTriggerAndOutput";
    pub const QUEUE_PAIR: &str = "QueueTriggerPair";
    pub const BLOB_TRIGGER: &str = "BlobTriggerToBlob";
    pub const HTTP_TRIGGER: &str = "HttpTrigger";
    pub const HTTP_QUEUE_OUTPUT: &str = "HttpTriggerQueueOutput";

    /// Prefix of the line the host logs when an invocation succeeds.
    pub fn executed_line(function: &str) -> String {
        format!("Executed 'Functions.{function}' (Succeeded")
    }
}

const LOG_TAIL_LINES: usize = 30;

#[derive(Debug)]
pub enum ScenarioError {
    Poll(PollError),
    Storage(StorageError),
    Invoke(InvokeError),
    Mismatch {
        what: String,
        expected: String,
        actual: String,
    },
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::Poll(e) => write!(f, "{}", e),
            ScenarioError::Storage(e) => write!(f, "storage: {}", e),
            ScenarioError::Invoke(e) => write!(f, "invoke: {}", e),
            ScenarioError::Mismatch {
                what,
                expected,
                actual,
            } => write!(f, "{}: expected {:?}, got {:?}", what, expected, actual),
        }
    }
}

impl std::error::Error for ScenarioError {}

impl From<PollError> for ScenarioError {
    fn from(e: PollError) -> Self {
        ScenarioError::Poll(e)
    }
}

impl From<StorageError> for ScenarioError {
    fn from(e: StorageError) -> Self {
        ScenarioError::Storage(e)
    }
}

impl From<InvokeError> for ScenarioError {
    fn from(e: InvokeError) -> Self {
        ScenarioError::Invoke(e)
    }
}

impl ScenarioError {
    pub(crate) fn mismatch(
        what: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        ScenarioError::Mismatch {
            what: what.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

/// Everything a scenario talks to.
pub struct Harness {
    pub storage: Arc<dyn StorageBackend>,
    pub invoker: FunctionInvoker,
    pub logs: LogView,
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
    pub resources: Resources,
    pub retry: RetryConfig,
}

impl Harness {
    pub fn new(
        fixture: &StorageFixture,
        invoker: FunctionInvoker,
        logs: LogView,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            storage: fixture.storage(),
            invoker,
            logs,
            policy,
            cancel: fixture.cancel_token(),
            resources: fixture.resources().clone(),
            retry: RetryConfig::default(),
        }
    }

    /// Enqueue a trigger input. Not retried: a put that failed late may
    /// still have been accepted, and a duplicate would leak into the next
    /// scenario's output.
    pub async fn seed_message(&self, queue: &str, body: &str) -> Result<String, ScenarioError> {
        let receipt = self.storage.insert_message(queue, body).await?;
        Ok(receipt.message_id)
    }

    /// Wait for the next message on `queue`.
    pub async fn next_message(&self, queue: &str) -> Result<String, ScenarioError> {
        let storage = self.storage.as_ref();
        let (message, _) = wait_for_cancellable(
            &self.policy,
            &self.cancel,
            || try_read_message(storage, queue),
            || format!("a message on queue '{}'", queue),
        )
        .await?;
        Ok(message)
    }

    /// Wait for the next message on `queue` and require it to equal `expected`.
    pub async fn expect_message(&self, queue: &str, expected: &str) -> Result<(), ScenarioError> {
        let actual = self.next_message(queue).await?;
        if actual != expected {
            return Err(ScenarioError::mismatch(
                format!("message on queue '{}'", queue),
                expected,
                actual,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    QueueTrigger,
    QueueTriggerLogs,
    QueuePair,
    BlobTrigger,
    HttpTrigger,
    HttpTriggerQueueOutput,
}

impl Scenario {
    pub fn all() -> &'static [Scenario] {
        &[
            Scenario::QueueTrigger,
            Scenario::QueueTriggerLogs,
            Scenario::QueuePair,
            Scenario::BlobTrigger,
            Scenario::HttpTrigger,
            Scenario::HttpTriggerQueueOutput,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::QueueTrigger => "queue-trigger",
            Scenario::QueueTriggerLogs => "queue-trigger-logs",
            Scenario::QueuePair => "queue-fan-in-pair",
            Scenario::BlobTrigger => "blob-trigger",
            Scenario::HttpTrigger => "http-trigger",
            Scenario::HttpTriggerQueueOutput => "http-trigger-queue-output",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::QueueTrigger => "queue message is copied to the output queue",
            Scenario::QueueTriggerLogs => "queue invocation shows up in the host log",
            Scenario::QueuePair => "two inputs come back as two tagged outputs",
            Scenario::BlobTrigger => "uploaded blob is copied to the output container",
            Scenario::HttpTrigger => "HTTP trigger greets by name and rejects a missing name",
            Scenario::HttpTriggerQueueOutput => "HTTP trigger writes the name to a queue",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.name() == name)
    }

    pub async fn run(&self, harness: &Harness) -> Result<(), ScenarioError> {
        match self {
            Scenario::QueueTrigger => queue::queue_trigger(harness).await,
            Scenario::QueueTriggerLogs => queue::queue_trigger_logs(harness).await,
            Scenario::QueuePair => queue::queue_pair(harness).await,
            Scenario::BlobTrigger => blob::blob_trigger(harness).await,
            Scenario::HttpTrigger => http::http_trigger(harness).await,
            Scenario::HttpTriggerQueueOutput => http::http_trigger_queue_output(harness).await,
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs scenarios one after another; they share the fixture's queues.
pub async fn run_scenarios(
    harness: &Harness,
    scenarios: &[Scenario],
) -> Vec<(Scenario, Result<(), ScenarioError>)> {
    let mut results = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let started = Instant::now();
        let result = scenario.run(harness).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => info!(scenario = scenario.name(), elapsed_ms, "scenario passed"),
            Err(e) => error!(scenario = scenario.name(), elapsed_ms, error = %e, "scenario failed"),
        }
        results.push((*scenario, result));
    }
    results
}

/// Unique payload so concurrent or repeated runs never match stale output.
pub(crate) fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}
