//! Mock message broker for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, MessageBroker, MessageHandler, Result};

/// A message accepted by [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub delay: Duration,
}

/// Mock broker that records publishes instead of sending them.
#[derive(Default)]
pub struct MockBroker {
    published: RwLock<Vec<PublishedMessage>>,
    consumers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    fail_on_publish: RwLock<bool>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
    closed: RwLock<bool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish while set.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail only the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Publish calls seen, failed ones included.
    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    /// Hand a payload to the consumer registered for `queue`, as a delivery would.
    pub async fn deliver(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let handler = self.consumers.read().await.get(queue).cloned().ok_or_else(|| {
            BusError::Subscribe {
                queue: queue.to_string(),
                message: "no consumer registered".to_string(),
            }
        })?;
        handler.handle(Arc::from(payload)).await
    }

    fn should_fail_once(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_publish.read().await || self.should_fail_once() {
            return Err(BusError::Publish {
                queue: queue.to_string(),
                message: "Mock publish failure".to_string(),
            });
        }
        self.published.write().await.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            delay,
        });
        Ok(())
    }

    async fn register_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let mut consumers = self.consumers.write().await;
        if consumers.contains_key(queue) {
            return Err(BusError::ConsumerAlreadyRegistered(queue.to_string()));
        }
        consumers.insert(queue.to_string(), handler);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closed.write().await = true;
        Ok(())
    }
}
