//! Queue-bound domain events.
//!
//! A [`QueueEvent`] binds one record type to one named queue: it publishes
//! records onto the queue and consumes deliveries transactionally. The
//! [`EventRegistry`] keeps exactly one event per queue name per process.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::bus::{BusError, MessageBroker, MessageHandler};
use crate::services::ServiceError;
use crate::storage::StorageError;

mod save_user;

pub use save_user::{SaveUserEvent, SAVE_USER_DELAY, SAVE_USER_QUEUE};

/// Errors raised while handling a queue event.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Queue '{0}' is already bound to a different event type")]
    Registry(String),

    #[error("Consumer setup failed for {count} queue(s)", count = .failed.len())]
    ConsumerSetup { failed: Vec<(String, BusError)> },
}

/// A record type bound to one queue.
#[async_trait]
pub trait QueueEvent: Send + Sync + 'static {
    /// Queue this event publishes to and consumes from.
    fn queue(&self) -> &str;

    /// Handle one delivered payload.
    async fn consume(&self, payload: &[u8]) -> Result<(), EventError>;
}

/// Adapts a [`QueueEvent`] to the broker's [`MessageHandler`].
struct EventConsumer {
    event: Arc<dyn QueueEvent>,
}

impl MessageHandler for EventConsumer {
    fn handle(&self, payload: Arc<[u8]>) -> BoxFuture<'static, Result<(), BusError>> {
        let event = Arc::clone(&self.event);
        Box::pin(async move {
            event.consume(&payload).await.map_err(|e| match e {
                EventError::Decode(e) => BusError::Deserialization {
                    queue: event.queue().to_string(),
                    message: e.to_string(),
                },
                other => BusError::Handler(other.to_string()),
            })
        })
    }
}

struct Registered {
    any: Arc<dyn Any + Send + Sync>,
    event: Arc<dyn QueueEvent>,
}

/// One event instance per queue name.
#[derive(Default)]
pub struct EventRegistry {
    events: Mutex<HashMap<String, Registered>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the event bound to `queue`, constructing it on first use.
    ///
    /// Later calls return the first instance and never run `make`. Asking for
    /// a queue that is bound to a different event type is an error.
    pub fn get_or_insert_with<E, F>(&self, queue: &str, make: F) -> Result<Arc<E>, EventError>
    where
        E: QueueEvent,
        F: FnOnce() -> E,
    {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(registered) = events.get(queue) {
            return Arc::clone(&registered.any)
                .downcast::<E>()
                .map_err(|_| EventError::Registry(queue.to_string()));
        }

        let event = Arc::new(make());
        events.insert(
            queue.to_string(),
            Registered {
                any: event.clone(),
                event: event.clone(),
            },
        );
        Ok(event)
    }

    /// Queue names with a bound event.
    pub fn queues(&self) -> Vec<String> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut queues: Vec<String> = events.keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Register a broker consumer for every bound event.
    ///
    /// Every event is attempted even when an earlier one fails, so each
    /// reaches the broker's registration map. Failures are returned together.
    pub async fn register_consumers(&self, broker: &dyn MessageBroker) -> Result<(), EventError> {
        let events: Vec<Arc<dyn QueueEvent>> = {
            let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            let mut events: Vec<_> = events.values().map(|r| Arc::clone(&r.event)).collect();
            events.sort_by(|a, b| a.queue().cmp(b.queue()));
            events
        };

        let mut failed = Vec::new();
        for event in events {
            let queue = event.queue().to_string();
            match broker
                .register_consumer(&queue, Arc::new(EventConsumer { event }))
                .await
            {
                Ok(()) => info!(queue = %queue, "Event consumer registered"),
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Event consumer setup failed");
                    failed.push((queue, e));
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(EventError::ConsumerSetup { failed })
        }
    }
}
