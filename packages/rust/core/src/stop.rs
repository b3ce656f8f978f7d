//! Cooperative per-topic stop signal, polled once per orchestrator loop.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use patchscout_shared::Result;
use patchscout_storage::Storage;

#[async_trait]
pub trait StopSignal: Send + Sync {
    async fn is_set(&self, topic_id: &str) -> Result<bool>;

    /// Consume the flag once a run has honored it.
    async fn clear(&self, topic_id: &str) -> Result<()>;
}

#[async_trait]
impl StopSignal for Storage {
    async fn is_set(&self, topic_id: &str) -> Result<bool> {
        self.is_stop_requested(topic_id).await
    }

    async fn clear(&self, topic_id: &str) -> Result<()> {
        self.clear_stop(topic_id).await
    }
}

/// In-process stop flags.
#[derive(Default)]
pub struct MemoryStopSignal {
    topics: Mutex<HashSet<String>>,
}

impl MemoryStopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, topic_id: &str) {
        self.topics.lock().await.insert(topic_id.to_string());
    }
}

#[async_trait]
impl StopSignal for MemoryStopSignal {
    async fn is_set(&self, topic_id: &str) -> Result<bool> {
        Ok(self.topics.lock().await.contains(topic_id))
    }

    async fn clear(&self, topic_id: &str) -> Result<()> {
        self.topics.lock().await.remove(topic_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_signal_is_per_topic() {
        let signal = MemoryStopSignal::new();
        signal.set("a").await;
        assert!(signal.is_set("a").await.unwrap());
        assert!(!signal.is_set("b").await.unwrap());
        signal.clear("a").await.unwrap();
        assert!(!signal.is_set("a").await.unwrap());
    }
}
