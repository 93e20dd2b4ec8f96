use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{MessageReceipt, StorageBackend, StorageError};

struct Visible<T> {
    value: T,
    visible_at: Instant,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<(String, Visible<String>)>>,
    containers: HashMap<String, HashMap<String, Visible<Bytes>>>,
    next_id: u64,
}

/// In-process storage. With a visibility delay, writes only show up to
/// readers once the delay has passed.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    visibility_delay: Duration,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_delay(visibility_delay: Duration) -> Self {
        Self {
            state: Mutex::default(),
            visibility_delay,
        }
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().await.containers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages in the queue, visible or not.
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Names of the visible blobs in `container`, sorted.
    pub async fn blob_names(&self, container: &str) -> Vec<String> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let mut names: Vec<_> = state
            .containers
            .get(container)
            .map(|blobs| {
                blobs
                    .iter()
                    .filter(|(_, blob)| blob.visible_at <= now)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn visible_at(&self) -> Instant {
        Instant::now() + self.visibility_delay
    }
}

fn missing(kind: &str, name: &str) -> StorageError {
    StorageError::NotFound {
        resource: format!("{kind} '{name}'"),
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryStorage {
    async fn create_queue(&self, queue: &str) -> Result<(), StorageError> {
        self.state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), StorageError> {
        self.state.lock().await.queues.remove(queue);
        Ok(())
    }

    async fn insert_message(
        &self,
        queue: &str,
        body: &str,
    ) -> Result<MessageReceipt, StorageError> {
        let visible_at = self.visible_at();
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let message_id = format!("msg-{}", state.next_id);
        let messages = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| missing("queue", queue))?;
        messages.push_back((
            message_id.clone(),
            Visible {
                value: body.to_string(),
                visible_at,
            },
        ));
        Ok(MessageReceipt { message_id })
    }

    async fn read_message(&self, queue: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let messages = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| missing("queue", queue))?;
        let position = messages
            .iter()
            .position(|(_, message)| message.visible_at <= now);
        Ok(position
            .and_then(|index| messages.remove(index))
            .map(|(_, message)| message.value))
    }

    async fn create_container(&self, container: &str) -> Result<(), StorageError> {
        self.state
            .lock()
            .await
            .containers
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> Result<(), StorageError> {
        self.state.lock().await.containers.remove(container);
        Ok(())
    }

    async fn upload_blob(
        &self,
        container: &str,
        name: &str,
        content: Bytes,
    ) -> Result<(), StorageError> {
        let visible_at = self.visible_at();
        let mut state = self.state.lock().await;
        let blobs = state
            .containers
            .get_mut(container)
            .ok_or_else(|| missing("container", container))?;
        blobs.insert(
            name.to_string(),
            Visible {
                value: content,
                visible_at,
            },
        );
        Ok(())
    }

    async fn download_blob(
        &self,
        container: &str,
        name: &str,
    ) -> Result<Option<Bytes>, StorageError> {
        let now = Instant::now();
        let state = self.state.lock().await;
        Ok(state
            .containers
            .get(container)
            .and_then(|blobs| blobs.get(name))
            .filter(|blob| blob.visible_at <= now)
            .map(|blob| blob.value.clone()))
    }
}
