//! Reconnecting broker client.
//!
//! Owns one logical connection. When the physical connection is lost a
//! monitor task waits a fixed delay, dials again until it succeeds, swaps the
//! new connection in and re-registers every known consumer on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{
    BrokerConnection, BusError, Connector, Established, MessageBroker, MessageHandler, Result,
};

/// The physical connection currently in use.
struct Live<C> {
    connection: Arc<C>,
    closed: Option<oneshot::Receiver<BusError>>,
    /// Bumped on every swap.
    generation: u64,
}

/// A registered consumer and the connection it is subscribed on.
struct Registration {
    handler: Arc<dyn MessageHandler>,
    subscribed_on: Option<u64>,
}

struct Inner<C: Connector> {
    connector: C,
    reconnect_delay: Duration,
    live: Mutex<Live<C::Connection>>,
    // Held across consumer setup so registration and replay never overlap.
    consumers: Mutex<HashMap<String, Registration>>,
    shutdown: watch::Sender<bool>,
}

/// Broker client that survives connection loss.
///
/// Publishes go to whatever connection is current; a publish racing a
/// connection loss fails and is reported to the caller.
pub struct BrokerClient<C: Connector> {
    inner: Arc<Inner<C>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> BrokerClient<C> {
    /// Dial once and start monitoring the connection.
    ///
    /// A failed first dial is returned to the caller.
    pub async fn connect(connector: C, reconnect_delay: Duration) -> Result<Self> {
        let Established { connection, closed } = connector.connect().await?;
        info!("Connected to message broker");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            connector,
            reconnect_delay,
            live: Mutex::new(Live {
                connection,
                closed: Some(closed),
                generation: 0,
            }),
            consumers: Mutex::new(HashMap::new()),
            shutdown,
        });

        let monitor = tokio::spawn(Arc::clone(&inner).monitor(shutdown_rx));

        Ok(Self {
            inner,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Number of successful reconnects so far.
    pub async fn generation(&self) -> u64 {
        self.inner.live.lock().await.generation
    }

    /// Queues with a registered consumer.
    pub async fn registered_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.inner.consumers.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }
}

impl<C: Connector> Inner<C> {
    async fn current(&self) -> (Arc<C::Connection>, u64) {
        let live = self.live.lock().await;
        (Arc::clone(&live.connection), live.generation)
    }

    async fn setup_consumer(&self, queue: &str, registration: &mut Registration) -> Result<()> {
        let (connection, generation) = self.current().await;
        connection
            .consume(queue, Arc::clone(&registration.handler))
            .await?;
        registration.subscribed_on = Some(generation);
        Ok(())
    }

    async fn monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let closed = self.live.lock().await.closed.take();
            let Some(closed) = closed else {
                return;
            };

            let reason = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                reason = closed => reason
                    .unwrap_or_else(|_| BusError::ConnectionClosed("connection dropped".to_string())),
            };

            if *shutdown.borrow() {
                return;
            }
            error!(error = %reason, "Broker connection lost");

            if !self.reconnect(&mut shutdown).await {
                return;
            }
            self.recover_consumers().await;
        }
    }

    /// Dial until a connection is established. Returns false on shutdown.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            attempt += 1;
            info!(attempt, "Attempting to reconnect to broker");
            match self.connector.connect().await {
                Ok(Established { connection, closed }) => {
                    let mut live = self.live.lock().await;
                    live.connection = connection;
                    live.closed = Some(closed);
                    live.generation += 1;
                    info!(attempt, generation = live.generation, "Reconnected to broker");
                    return true;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Reconnect failed");
                }
            }
        }
    }

    async fn recover_consumers(&self) {
        let mut consumers = self.consumers.lock().await;
        let generation = self.live.lock().await.generation;

        for (queue, registration) in consumers.iter_mut() {
            if registration.subscribed_on == Some(generation) {
                continue;
            }
            info!(queue = %queue, "Re-registering consumer");
            if let Err(e) = self.setup_consumer(queue, registration).await {
                error!(queue = %queue, error = %e, "Failed to re-register consumer");
            }
        }
    }
}

#[async_trait]
impl<C: Connector> MessageBroker for BrokerClient<C> {
    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        let (connection, _) = self.inner.current().await;
        let result = connection.publish(queue, payload, delay).await;

        match &result {
            Ok(()) => {
                info!(queue = %queue, delay_ms = delay.as_millis() as u64, "Message published");
            }
            Err(e) => {
                error!(
                    queue = %queue,
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "Failed to publish message"
                );
            }
        }
        result
    }

    async fn register_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let mut consumers = self.inner.consumers.lock().await;
        if consumers.contains_key(queue) {
            return Err(BusError::ConsumerAlreadyRegistered(queue.to_string()));
        }

        let registration = consumers.entry(queue.to_string()).or_insert(Registration {
            handler,
            subscribed_on: None,
        });

        match self.inner.setup_consumer(queue, registration).await {
            Ok(()) => {
                info!(queue = %queue, "Consumer registered");
                Ok(())
            }
            Err(e) => {
                warn!(
                    queue = %queue,
                    error = %e,
                    "Consumer setup failed; registration kept for the next reconnect"
                );
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let _ = self.inner.shutdown.send(true);

        if let Some(monitor) = self.monitor.lock().await.take() {
            if let Err(e) = monitor.await {
                warn!(error = %e, "Connection monitor ended abnormally");
            }
        }

        let (connection, _) = self.inner.current().await;
        connection.close().await?;
        info!("Broker connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, MemoryBroker, MemoryConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(count: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_payload| {
            let count = Arc::clone(&count);
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let server = MemoryBroker::new();
        server.set_available(false);

        let result =
            BrokerClient::connect(MemoryConnector::new(server), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_duplicate_consumer_rejected() {
        let server = MemoryBroker::new();
        let client = BrokerClient::connect(MemoryConnector::new(server), Duration::from_millis(10))
            .await
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        client
            .register_consumer("q", counting_handler(Arc::clone(&count)))
            .await
            .unwrap();
        let err = client
            .register_consumer("q", counting_handler(count))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::ConsumerAlreadyRegistered(q) if q == "q"));
        assert_eq!(client.registered_queues().await, vec!["q".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_reaches_consumer() {
        let server = MemoryBroker::new();
        let client = BrokerClient::connect(
            MemoryConnector::new(server.clone()),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        client
            .register_consumer("q", counting_handler(Arc::clone(&count)))
            .await
            .unwrap();
        client.publish("q", b"{}", Duration::ZERO).await.unwrap();

        wait_for(&count, 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(server.acked(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_replays_consumers_once() {
        let server = MemoryBroker::new();
        let client = BrokerClient::connect(
            MemoryConnector::new(server.clone()),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        client
            .register_consumer("q", counting_handler(Arc::clone(&count)))
            .await
            .unwrap();

        server.kill_connections();
        for _ in 0..200 {
            if client.generation().await >= 1 && server.consumer_count("q") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.generation().await, 1);
        assert_eq!(server.consumer_count("q"), 1);

        client.publish("q", b"{}", Duration::ZERO).await.unwrap();
        wait_for(&count, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_dialing_until_available() {
        let server = MemoryBroker::new();
        let client = BrokerClient::connect(
            MemoryConnector::new(server.clone()),
            Duration::from_millis(5),
        )
        .await
        .unwrap();

        server.refuse_next_dials(3);
        server.kill_connections();

        for _ in 0..200 {
            if client.generation().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.generation().await, 1);
        assert_eq!(server.dial_attempts(), 5);
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let server = MemoryBroker::new();
        let client = BrokerClient::connect(
            MemoryConnector::new(server.clone()),
            Duration::from_millis(5),
        )
        .await
        .unwrap();

        client.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(server.live_connections(), 0);
        assert_eq!(server.dial_attempts(), 1);
    }
}
