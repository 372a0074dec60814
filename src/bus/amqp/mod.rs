//! AMQP (RabbitMQ) connector.
//!
//! Publishes through a `x-delayed-message` exchange so a per-message `x-delay`
//! header holds delivery back. Every queue is durable and bound to the
//! exchange with its own name as routing key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, Instrument};

use super::consumers::ConsumerTasks;
use super::{
    BrokerConnection, BusError, Connector, Established, MessageHandler, Result,
    CONSUMER_DRAIN_TIMEOUT, DELAYED_EXCHANGE,
};

/// Exchange type provided by the RabbitMQ delayed-message plugin.
const DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";

/// Dials RabbitMQ.
#[derive(Clone, Debug)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<Established<AmqpConnection>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let (tx, closed) = oneshot::channel();
        let mut tx = Some(tx);
        connection.on_error(move |e| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(BusError::ConnectionClosed(e.to_string()));
            }
        });

        info!(url = %self.url, "Connected to AMQP");

        Ok(Established {
            connection: Arc::new(AmqpConnection {
                connection,
                consumers: ConsumerTasks::new(),
            }),
            closed,
        })
    }
}

/// One RabbitMQ connection. Channels are opened per operation.
pub struct AmqpConnection {
    connection: Connection,
    consumers: ConsumerTasks,
}

impl AmqpConnection {
    async fn channel(&self, queue: &str) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| BusError::Channel {
                queue: queue.to_string(),
                message: format!("Failed to create channel: {}", e),
            })
    }

    async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare {
                queue: queue.to_string(),
                message: format!("Failed to declare queue: {}", e),
            })?;
        Ok(())
    }

    async fn declare_topology(channel: &Channel, queue: &str) -> Result<()> {
        let declare_err = |e: lapin::Error, what: &str| BusError::Declare {
            queue: queue.to_string(),
            message: format!("Failed to {}: {}", what, e),
        };

        channel
            .exchange_declare(
                DELAYED_EXCHANGE,
                ExchangeKind::Custom(DELAYED_EXCHANGE_KIND.to_string()),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                delayed_exchange_args(),
            )
            .await
            .map_err(|e| declare_err(e, "declare exchange"))?;

        Self::declare_queue(channel, queue).await?;

        channel
            .queue_bind(
                queue,
                DELAYED_EXCHANGE,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_err(e, "bind queue"))?;

        Ok(())
    }

    async fn publish_on(channel: &Channel, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        Self::declare_topology(channel, queue).await?;

        let publish_err = |e: lapin::Error| BusError::Publish {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        channel
            .basic_publish(
                DELAYED_EXCHANGE,
                queue,
                BasicPublishOptions::default(),
                payload,
                publish_properties(delay),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;

        debug!(queue = %queue, delay_ms = delay.as_millis() as u64, "Published message");
        Ok(())
    }

    /// Ack on success; nack without requeue on failure.
    async fn process_delivery(queue: &str, delivery: Delivery, handler: &Arc<dyn MessageHandler>) {
        let consume_span = tracing::info_span!("bus.consume", queue = %queue);
        let result = handler
            .handle(Arc::from(delivery.data.as_slice()))
            .instrument(consume_span)
            .await;

        match result {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(queue = %queue, error = %e, "Failed to ack message");
                }
            }
            Err(e) => {
                error!(
                    queue = %queue,
                    payload = %String::from_utf8_lossy(&delivery.data),
                    error = %e,
                    "Consumer callback failed, message dropped"
                );
                let options = BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                };
                if let Err(e) = delivery.nack(options).await {
                    error!(queue = %queue, error = %e, "Failed to nack message");
                }
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        let channel = self.channel(queue).await?;
        let result = Self::publish_on(&channel, queue, payload, delay).await;
        if let Err(e) = channel.close(200, "OK").await {
            debug!(queue = %queue, error = %e, "Failed to close publish channel");
        }
        result
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let channel = self.channel(queue).await?;
        Self::declare_queue(&channel, queue).await?;

        let mut consumer = channel
            .basic_consume(
                queue,
                &format!("user-importer-{}", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe {
                queue: queue.to_string(),
                message: format!("Failed to start consumer: {}", e),
            })?;

        info!(queue = %queue, "Consumer connected, processing messages");

        let queue = queue.to_string();
        let stopped = self.consumers.stopped();
        self.consumers.spawn(async move {
            // The channel must outlive the consumer stream.
            let _channel = channel;
            tokio::pin!(stopped);
            loop {
                // Stop between deliveries; the current one always finishes.
                let delivery = tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    delivery = consumer.next() => delivery,
                };
                match delivery {
                    Some(Ok(delivery)) => Self::process_delivery(&queue, delivery, &handler).await,
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Consumer delivery error");
                        break;
                    }
                    None => break,
                }
            }
            info!(queue = %queue, "Consumer stream ended");
        });

        Ok(())
    }

    /// Stops the receive loops, lets in-flight deliveries finish and ack,
    /// then closes the connection.
    async fn close(&self) -> Result<()> {
        self.consumers.drain(CONSUMER_DRAIN_TIMEOUT).await;
        self.connection
            .close(200, "Bye")
            .await
            .map_err(|e| BusError::ConnectionClosed(format!("Failed to close connection: {}", e)))
    }
}

fn delayed_exchange_args() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-delayed-type".into(), AMQPValue::LongString("direct".into()));
    args
}

/// Persistent message with the delay in milliseconds.
fn publish_properties(delay: Duration) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        "x-delay".into(),
        AMQPValue::LongLongInt(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)),
    );

    BasicProperties::default()
        .with_content_type("text/plain".into())
        .with_delivery_mode(2) // persistent
        .with_headers(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delayed_exchange_args() {
        let args = delayed_exchange_args();
        assert!(matches!(
            args.inner().get("x-delayed-type"),
            Some(AMQPValue::LongString(kind)) if kind.as_bytes() == b"direct"
        ));
    }

    #[test]
    fn test_publish_properties_carry_delay_ms() {
        let properties = publish_properties(Duration::from_secs(2));

        assert_eq!(properties.delivery_mode(), &Some(2));
        let headers = properties.headers().as_ref().unwrap();
        assert!(matches!(
            headers.inner().get("x-delay"),
            Some(AMQPValue::LongLongInt(2000))
        ));
    }

    #[test]
    fn test_zero_delay_header() {
        let properties = publish_properties(Duration::ZERO);
        let headers = properties.headers().as_ref().unwrap();
        assert!(matches!(
            headers.inner().get("x-delay"),
            Some(AMQPValue::LongLongInt(0))
        ));
    }
}
