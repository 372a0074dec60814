//! In-memory broker server and connector.
//!
//! Behaves like a single broker node: durable named queues, round-robin
//! delivery across consumers, delayed publish, ack/nack accounting. Tests can
//! drop every live connection or refuse dials to exercise reconnects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, Instrument};

use crate::bus::consumers::ConsumerTasks;
use crate::bus::{
    BrokerConnection, BusError, Connector, Established, MessageHandler, Result,
    CONSUMER_DRAIN_TIMEOUT,
};

struct Subscriber {
    connection: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    subscribers: Vec<Subscriber>,
    next: usize,
}

#[derive(Default)]
struct ServerState {
    next_connection: u64,
    connections: HashMap<u64, oneshot::Sender<BusError>>,
    queues: HashMap<String, QueueState>,
    unavailable: bool,
    refuse_dials: usize,
    dial_attempts: usize,
    published: usize,
    acked: usize,
    nacked: usize,
}

impl ServerState {
    fn deliver(&mut self, queue: &str, payload: Vec<u8>) {
        let state = self.queues.entry(queue.to_string()).or_default();
        let mut payload = payload;
        while !state.subscribers.is_empty() {
            let index = state.next % state.subscribers.len();
            match state.subscribers[index].tx.send(payload) {
                Ok(()) => {
                    state.next = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    state.subscribers.remove(index);
                    payload = returned;
                }
            }
        }
        state.ready.push_back(payload);
    }

    fn drop_connection(&mut self, id: u64) -> Option<oneshot::Sender<BusError>> {
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.connection != id);
        }
        self.connections.remove(&id)
    }
}

/// Shared in-memory broker node.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse (false) or accept (true) every dial.
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    /// Refuse the next `count` dials.
    pub fn refuse_next_dials(&self, count: usize) {
        self.state().refuse_dials = count;
    }

    /// Drop every live connection, firing their close signals.
    pub fn kill_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(closed) = state.drop_connection(id) {
                let _ = closed.send(BusError::ConnectionClosed(format!(
                    "connection {} killed",
                    id
                )));
            }
        }
    }

    pub fn live_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn dial_attempts(&self) -> usize {
        self.state().dial_attempts
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.subscribers.len())
            .unwrap_or(0)
    }

    /// Messages waiting in a queue with no consumer to take them.
    pub fn pending(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn published(&self) -> usize {
        self.state().published
    }

    pub fn acked(&self) -> usize {
        self.state().acked
    }

    pub fn nacked(&self) -> usize {
        self.state().nacked
    }

    fn dial(&self) -> Result<(u64, oneshot::Receiver<BusError>)> {
        let mut state = self.state();
        state.dial_attempts += 1;
        if state.unavailable {
            return Err(BusError::Connection("broker unavailable".to_string()));
        }
        if state.refuse_dials > 0 {
            state.refuse_dials -= 1;
            return Err(BusError::Connection("connection refused".to_string()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (tx, rx) = oneshot::channel();
        state.connections.insert(id, tx);
        Ok((id, rx))
    }

    fn is_live(&self, id: u64) -> bool {
        self.state().connections.contains_key(&id)
    }
}

/// [`Connector`] dialing a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Established<MemoryConnection>> {
        let (id, closed) = self.broker.dial()?;
        debug!(connection = id, "In-memory connection opened");
        Ok(Established {
            connection: Arc::new(MemoryConnection {
                id,
                broker: self.broker.clone(),
                consumers: ConsumerTasks::new(),
            }),
            closed,
        })
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    consumers: ConsumerTasks,
}

impl MemoryConnection {
    fn ensure_live(&self, queue: &str) -> Result<()> {
        if self.broker.is_live(self.id) {
            Ok(())
        } else {
            Err(BusError::Channel {
                queue: queue.to_string(),
                message: format!("connection {} is closed", self.id),
            })
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        self.ensure_live(queue)?;

        let payload = payload.to_vec();
        let mut state = self.broker.state();
        state.published += 1;
        if delay.is_zero() {
            state.deliver(queue, payload);
        } else {
            drop(state);
            let broker = self.broker.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                broker.state().deliver(&queue, payload);
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        {
            let mut state = self.broker.state();
            if !state.connections.contains_key(&self.id) {
                return Err(BusError::Subscribe {
                    queue: queue.to_string(),
                    message: format!("connection {} is closed", self.id),
                });
            }
            let queue_state = state.queues.entry(queue.to_string()).or_default();
            while let Some(payload) = queue_state.ready.pop_front() {
                let _ = tx.send(payload);
            }
            queue_state.subscribers.push(Subscriber {
                connection: self.id,
                tx,
            });
        }

        let broker = self.broker.clone();
        let span = tracing::info_span!("bus.consume", queue = %queue, connection = self.id);
        let queue = queue.to_string();
        let stopped = self.consumers.stopped();
        self.consumers.spawn(
            async move {
                tokio::pin!(stopped);
                loop {
                    let payload = tokio::select! {
                        biased;
                        _ = &mut stopped => {
                            // Unhandled deliveries go back to the queue.
                            let mut state = broker.state();
                            while let Ok(payload) = rx.try_recv() {
                                state
                                    .queues
                                    .entry(queue.clone())
                                    .or_default()
                                    .ready
                                    .push_back(payload);
                            }
                            break;
                        }
                        payload = rx.recv() => match payload {
                            Some(payload) => payload,
                            None => break,
                        },
                    };
                    match handler.handle(Arc::from(payload.as_slice())).await {
                        Ok(()) => broker.state().acked += 1,
                        Err(e) => {
                            error!(
                                queue = %queue,
                                payload = %String::from_utf8_lossy(&payload),
                                error = %e,
                                "Consumer callback failed, message dropped"
                            );
                            broker.state().nacked += 1;
                        }
                    }
                }
                debug!(queue = %queue, "Consumer stream ended");
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The close signal is dropped unsent: a deliberate close.
        self.broker.state().drop_connection(self.id);
        self.consumers.drain(CONSUMER_DRAIN_TIMEOUT).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn connect(broker: &MemoryBroker) -> Established<MemoryConnection> {
        MemoryConnector::new(broker.clone()).connect().await.unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_messages_wait_for_consumer() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await.connection;

        conn.publish("q", b"1", Duration::ZERO).await.unwrap();
        conn.publish("q", b"2", Duration::ZERO).await.unwrap();
        assert_eq!(broker.pending("q"), 2);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        conn.consume(
            "q",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .await
        .unwrap();

        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(broker.pending("q"), 0);
        assert_eq!(broker.acked(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_nacks_without_redelivery() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await.connection;
        conn.consume(
            "q",
            handler_fn(|_| Box::pin(async { Err(BusError::Handler("boom".into())) })),
        )
        .await
        .unwrap();

        conn.publish("q", b"x", Duration::ZERO).await.unwrap();
        settle().await;

        assert_eq!(broker.nacked(), 1);
        assert_eq!(broker.acked(), 0);
        assert_eq!(broker.pending("q"), 0);
    }

    #[tokio::test]
    async fn test_delayed_publish() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await.connection;

        conn.publish("q", b"x", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(broker.pending("q"), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(broker.pending("q"), 1);
    }

    #[tokio::test]
    async fn test_kill_fires_close_signal() {
        let broker = MemoryBroker::new();
        let Established { connection, closed } = connect(&broker).await;

        broker.kill_connections();

        assert!(matches!(closed.await, Ok(BusError::ConnectionClosed(_))));
        assert!(connection
            .publish("q", b"x", Duration::ZERO)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unavailable_refuses_dials() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let result = MemoryConnector::new(broker.clone()).connect().await;
        assert!(matches!(result, Err(BusError::Connection(_))));
        assert_eq!(broker.dial_attempts(), 1);
    }
}
