//! Shared queues and containers for a collection of scenarios.
//!
//! Scenarios in one collection reuse the same resources and must run one
//! after another; the test runner enforces that, not the fixture.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::poll::retry::{with_retry, RetryConfig};
use crate::storage::{StorageBackend, StorageError};

/// Names of every shared queue and container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    pub input_queue: String,
    pub output_queue: String,
    pub pair_input_queue: String,
    pub pair_output_queue: String,
    pub http_output_queue: String,
    pub input_container: String,
    pub output_container: String,
}

impl Resources {
    /// `test-input-{suffix}` and friends. Queue and container names must be
    /// lowercase.
    pub fn with_suffix(suffix: &str) -> Self {
        let suffix = suffix.to_ascii_lowercase();
        Self {
            input_queue: format!("test-input-{suffix}"),
            output_queue: format!("test-output-{suffix}"),
            pair_input_queue: format!("test-input-pair-{suffix}"),
            pair_output_queue: format!("test-output-pair-{suffix}"),
            http_output_queue: format!("test-output-http-{suffix}"),
            input_container: format!("test-input-{suffix}"),
            output_container: format!("test-output-{suffix}"),
        }
    }

    pub fn queues(&self) -> [&str; 5] {
        [
            &self.input_queue,
            &self.output_queue,
            &self.pair_input_queue,
            &self.pair_output_queue,
            &self.http_output_queue,
        ]
    }

    pub fn containers(&self) -> [&str; 2] {
        [&self.input_container, &self.output_container]
    }
}

pub struct StorageFixture {
    storage: Arc<dyn StorageBackend>,
    resources: Resources,
    cancel: CancellationToken,
    retry: RetryConfig,
}

impl StorageFixture {
    /// Create every resource and drain queue leftovers from earlier runs.
    pub async fn setup(
        storage: Arc<dyn StorageBackend>,
        resources: Resources,
        parent: &CancellationToken,
    ) -> Result<Self, StorageError> {
        let retry = RetryConfig::default();

        for queue in resources.queues() {
            with_retry(&retry, "create_queue", || storage.create_queue(queue)).await?;
            let stale =
                with_retry(&retry, "drain_queue", || storage.read_all_messages(queue)).await?;
            if !stale.is_empty() {
                info!(queue, count = stale.len(), "drained stale messages");
            }
        }
        for container in resources.containers() {
            with_retry(&retry, "create_container", || {
                storage.create_container(container)
            })
            .await?;
        }
        info!(
            queues = resources.queues().len(),
            containers = resources.containers().len(),
            "storage fixture ready"
        );

        Ok(Self {
            storage,
            resources,
            cancel: parent.child_token(),
            retry,
        })
    }

    /// Handle on resources provisioned elsewhere, e.g. by an earlier `setup`.
    pub fn attach(
        storage: Arc<dyn StorageBackend>,
        resources: Resources,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            storage,
            resources,
            cancel: parent.child_token(),
            retry: RetryConfig::default(),
        }
    }

    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Cancelled at teardown; polls using it exit early.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel outstanding polls, then delete every resource. All deletions
    /// are attempted; the first failure is returned.
    pub async fn teardown(self) -> Result<(), StorageError> {
        self.cancel.cancel();

        let mut first_error = None;
        for queue in self.resources.queues() {
            if let Err(e) =
                with_retry(&self.retry, "delete_queue", || self.storage.delete_queue(queue)).await
            {
                warn!(queue, error = %e, "failed to delete queue");
                first_error.get_or_insert(e);
            }
        }
        for container in self.resources.containers() {
            if let Err(e) = with_retry(&self.retry, "delete_container", || {
                self.storage.delete_container(container)
            })
            .await
            {
                warn!(container, error = %e, "failed to delete container");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("storage fixture torn down");
                Ok(())
            }
        }
    }
}
