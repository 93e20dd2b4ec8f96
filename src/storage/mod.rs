//! Queue and blob storage used to seed trigger inputs and read binding outputs.
//!
//! `StorageBackend` is the narrow surface the scenarios need. Reads inside a
//! probe must treat any error as "not yet": writes may take a moment to become
//! visible and freshly created queues can briefly report not found.

mod account;
mod auth;
mod azure;
mod memory;
mod xml;

pub use account::{Credentials, StorageAccount, DEV_ACCOUNT_NAME};
pub use azure::{AzureStorageClient, MessageEncoding};
pub use memory::MemoryStorage;

use bytes::Bytes;
use tracing::debug;

use crate::poll::retry::IsRetryable;

/// Confirmation returned by the service when a message is enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReceipt {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    NotFound {
        resource: String,
    },
    Http {
        status: u16,
        operation: &'static str,
        detail: String,
    },
    Network(String),
    Timeout,
    InvalidConnectionString(String),
    Decode(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound { resource } => write!(f, "{} not found", resource),
            StorageError::Http {
                status,
                operation,
                detail,
            } => write!(f, "{} failed with HTTP {}: {}", operation, status, detail),
            StorageError::Network(msg) => write!(f, "network error: {}", msg),
            StorageError::Timeout => write!(f, "storage request timed out"),
            StorageError::InvalidConnectionString(msg) => {
                write!(f, "invalid connection string: {}", msg)
            }
            StorageError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl IsRetryable for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            StorageError::Http { status, .. } => matches!(status, 500 | 502..=504),
            StorageError::Network(_) | StorageError::Timeout => true,
            StorageError::NotFound { .. }
            | StorageError::InvalidConnectionString(_)
            | StorageError::Decode(_) => false,
        }
    }
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Creates the queue; an existing queue is not an error.
    async fn create_queue(&self, queue: &str) -> Result<(), StorageError>;

    /// Deletes the queue; a missing queue is not an error.
    async fn delete_queue(&self, queue: &str) -> Result<(), StorageError>;

    async fn insert_message(&self, queue: &str, body: &str)
        -> Result<MessageReceipt, StorageError>;

    /// Dequeues and deletes one visible message.
    async fn read_message(&self, queue: &str) -> Result<Option<String>, StorageError>;

    /// Drains every currently visible message.
    async fn read_all_messages(&self, queue: &str) -> Result<Vec<String>, StorageError> {
        let mut messages = Vec::new();
        while let Some(message) = self.read_message(queue).await? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Creates the container; an existing container is not an error.
    async fn create_container(&self, container: &str) -> Result<(), StorageError>;

    /// Deletes the container and its blobs; a missing container is not an error.
    async fn delete_container(&self, container: &str) -> Result<(), StorageError>;

    async fn upload_blob(
        &self,
        container: &str,
        name: &str,
        content: Bytes,
    ) -> Result<(), StorageError>;

    /// Returns `None` when the blob (or its container) does not exist.
    async fn download_blob(&self, container: &str, name: &str)
        -> Result<Option<Bytes>, StorageError>;
}

/// Probe helper: one dequeue attempt, errors count as "nothing yet".
pub async fn try_read_message(storage: &dyn StorageBackend, queue: &str) -> Option<String> {
    match storage.read_message(queue).await {
        Ok(message) => message,
        Err(e) => {
            debug!(queue, error = %e, "queue read failed, treating as empty");
            None
        }
    }
}

/// Probe helper: one download attempt, errors count as "not there yet".
pub async fn try_download_blob(
    storage: &dyn StorageBackend,
    container: &str,
    name: &str,
) -> Option<Bytes> {
    match storage.download_blob(container, name).await {
        Ok(content) => content,
        Err(e) => {
            debug!(container, blob = name, error = %e, "blob read failed, treating as absent");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        for status in [500, 502, 503, 504] {
            let err = StorageError::Http {
                status,
                operation: "put_message",
                detail: String::new(),
            };
            assert!(err.is_retryable(), "{status}");
        }
        let conflict = StorageError::Http {
            status: 409,
            operation: "create_container",
            detail: "ContainerBeingDeleted".to_string(),
        };
        assert!(!conflict.is_retryable());
        assert!(StorageError::Timeout.is_retryable());
        assert!(!StorageError::NotFound {
            resource: "queue q".to_string()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn try_helpers_absorb_missing_resources() {
        let storage = MemoryStorage::new();
        assert_eq!(try_read_message(&storage, "missing").await, None);
        assert_eq!(try_download_blob(&storage, "missing", "blob").await, None);
    }

    #[tokio::test]
    async fn default_drain_reads_until_empty() {
        let storage = MemoryStorage::new();
        storage.create_queue("drain").await.unwrap();
        for body in ["a", "b", "c"] {
            storage.insert_message("drain", body).await.unwrap();
        }
        let drained = storage.read_all_messages("drain").await.unwrap();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert_eq!(storage.read_message("drain").await.unwrap(), None);
    }
}
