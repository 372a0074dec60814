//! Message broker client.
//!
//! This module contains:
//! - `MessageBroker` trait: delayed publish and consumer registration
//! - `MessageHandler` trait: callback invoked per delivered message
//! - `Connector` / `BrokerConnection` traits: one physical connection
//! - `BrokerClient`: reconnecting client that replays consumers
//! - Implementations: AMQP (RabbitMQ), in-memory, mock

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
mod client;
mod consumers;
pub mod memory;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConnection, AmqpConnector};
pub use client::BrokerClient;
pub use memory::{MemoryBroker, MemoryConnector};
pub use mock::MockBroker;

/// Delayed-message exchange every queue is bound to.
pub const DELAYED_EXCHANGE: &str = "delayed_exchange";

/// How long closing a connection waits for in-flight deliveries.
pub const CONSUMER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Channel error on queue '{queue}': {message}")]
    Channel { queue: String, message: String },

    #[error("Declaration failed for queue '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Publish to queue '{queue}' failed: {message}")]
    Publish { queue: String, message: String },

    #[error("Subscribe to queue '{queue}' failed: {message}")]
    Subscribe { queue: String, message: String },

    #[error("Failed to serialize message for queue '{queue}': {message}")]
    Serialization { queue: String, message: String },

    #[error("Failed to deserialize message from queue '{queue}': {message}")]
    Deserialization { queue: String, message: String },

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Consumer already registered for queue '{0}'")]
    ConsumerAlreadyRegistered(String),
}

impl BusError {
    /// Infrastructure failures that a reconnect or a later attempt may fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Connection(_)
                | BusError::ConnectionClosed(_)
                | BusError::Channel { .. }
                | BusError::Publish { .. }
        )
    }
}

/// Handler for processing messages delivered from a queue.
///
/// `Ok` acknowledges the message. `Err` negatively acknowledges it without
/// requeueing; the handler owns any further durability.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: Arc<[u8]>) -> BoxFuture<'static, Result<()>>;
}

/// [`MessageHandler`] backed by a closure.
pub struct FnHandler<F>(F);

impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<[u8]>) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    fn handle(&self, payload: Arc<[u8]>) -> BoxFuture<'static, Result<()>> {
        (self.0)(payload)
    }
}

/// Wrap a closure returning a boxed future as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<[u8]>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Publish/subscribe over a message broker.
///
/// Implementations:
/// - `BrokerClient`: reconnecting client over any `Connector`
/// - `MockBroker`: records publishes, for testing
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish a payload to a durable queue after `delay` (zero = immediately).
    ///
    /// Declares the delayed exchange, the queue and its binding on the way;
    /// the declarations are idempotent.
    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()>;

    /// Register a consumer callback for a queue and start receiving.
    ///
    /// The registration is kept even if the initial setup fails, and is
    /// replayed after every reconnect.
    async fn register_consumer(&self, queue: &str, handler: Arc<dyn MessageHandler>)
        -> Result<()>;

    /// Close the connection and stop reconnecting.
    async fn close(&self) -> Result<()>;
}

/// JSON convenience on top of [`MessageBroker::publish`].
#[async_trait]
pub trait MessageBrokerExt {
    async fn publish_json<T>(&self, queue: &str, message: &T, delay: Duration) -> Result<()>
    where
        T: Serialize + Sync + ?Sized;
}

#[async_trait]
impl<B> MessageBrokerExt for B
where
    B: MessageBroker + ?Sized,
{
    async fn publish_json<T>(&self, queue: &str, message: &T, delay: Duration) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_vec(message).map_err(|e| BusError::Serialization {
            queue: queue.to_string(),
            message: e.to_string(),
        })?;
        self.publish(queue, &payload, delay).await
    }
}

/// A freshly dialed connection and the signal that fires when it is lost.
pub struct Established<C> {
    pub connection: Arc<C>,
    pub closed: oneshot::Receiver<BusError>,
}

/// Dials physical connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self) -> Result<Established<Self::Connection>>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Declare exchange, queue and binding, then publish persistently.
    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()>;

    /// Declare the queue and spawn a receive loop feeding `handler`.
    ///
    /// The loop ends when the connection goes away or is closed.
    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Stop the receive loops, wait up to [`CONSUMER_DRAIN_TIMEOUT`] for the
    /// deliveries they are handling, then close.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Fixed pause between reconnect attempts after a connection loss.
    pub reconnect_delay_secs: u64,
}

impl AmqpConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            reconnect_delay_secs: 5,
        }
    }
}

/// Connect to the configured broker.
///
/// The first dial is retried with backoff; if the broker stays unreachable
/// the error is returned and the caller is expected to exit.
#[cfg(feature = "amqp")]
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn MessageBroker>> {
    use backon::Retryable;
    use tracing::warn;

    use crate::utils::retry::connection_backoff;

    let client = (|| async move {
        BrokerClient::connect(
            AmqpConnector::new(config.amqp.url.clone()),
            config.amqp.reconnect_delay(),
        )
        .await
    })
    .retry(connection_backoff())
    .when(|e: &BusError| e.is_transient())
    .notify(|err: &BusError, dur: Duration| {
        warn!(service = "amqp", error = %err, delay = ?dur, "Connection failed, retrying");
    })
    .await?;

    Ok(Arc::new(client))
}
