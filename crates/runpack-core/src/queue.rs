use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Dispatch message handed to the external queue. Carries no money values —
/// workers read authoritative amounts from the Run Store (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub run_id: String,
    pub tenant_id: String,
    pub pack_spec: serde_json::Value,
    pub lease_ttl_seconds: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("dispatcher error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn enqueue(&self, message: DispatchMessage) -> Result<(), DispatcherError>;

    /// Pulls the next message, if any. Real queue backends (SQS, etc.)
    /// are usually polled by workers directly rather than through this
    /// trait; the in-process `runpack-worker` here instead polls the
    /// service's `/internal/v1/queue/next`, which calls this.
    async fn dequeue(&self) -> Result<Option<DispatchMessage>, DispatcherError>;
}

#[must_use]
pub fn memory() -> MemoryDispatcher {
    MemoryDispatcher::default()
}

/// In-memory FIFO dispatcher. Doubles as the test fixture for the
/// Submission Path — workers in tests drain `take_all`.
#[derive(Default)]
pub struct MemoryDispatcher {
    messages: Mutex<VecDeque<DispatchMessage>>,
}

impl MemoryDispatcher {
    pub async fn take_all(&self) -> Vec<DispatchMessage> {
        std::mem::take(&mut *self.messages.lock().await).into_iter().collect()
    }
}

#[async_trait]
impl Dispatcher for MemoryDispatcher {
    async fn enqueue(&self, message: DispatchMessage) -> Result<(), DispatcherError> {
        self.messages.lock().await.push_back(message);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<DispatchMessage>, DispatcherError> {
        Ok(self.messages.lock().await.pop_front())
    }
}
