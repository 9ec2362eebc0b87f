//! AMQP 0.9.1 transport on `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};

use crate::errors::QueueError;

use super::{
    Acker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, OutboundMessage,
    QueueArguments, RETRY_HEADER, Transport,
};

/// Connects to a RabbitMQ-compatible broker.
#[derive(Debug, Clone)]
pub struct AmqpTransport {
    url: String,
    connection_name: String,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let connection = lapin::Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Channel(format!("confirm_select failed: {}", e)))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner
            .close(200, "ticketflow shutdown")
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

fn queue_arguments(args: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &args.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(routing_key) = &args.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    if let Some(ttl) = args.message_ttl_ms {
        table.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(i64::try_from(ttl).unwrap_or(i64::MAX)),
        );
    }
    table
}

/// Read the retry counter, tolerating whichever integer width the
/// publisher used. Missing or unreadable headers count as attempt 0.
pub(crate) fn retry_count(headers: Option<&FieldTable>) -> u32 {
    let Some(value) = headers.and_then(|table| {
        table
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == RETRY_HEADER)
            .map(|(_, value)| value)
    }) else {
        return 0;
    };
    let count = match value {
        AMQPValue::ShortShortInt(n) => i64::from(*n),
        AMQPValue::ShortShortUInt(n) => i64::from(*n),
        AMQPValue::ShortInt(n) => i64::from(*n),
        AMQPValue::ShortUInt(n) => i64::from(*n),
        AMQPValue::LongInt(n) => i64::from(*n),
        AMQPValue::LongUInt(n) => i64::from(*n),
        AMQPValue::LongLongInt(n) => *n,
        _ => 0,
    };
    u32::try_from(count).unwrap_or(0)
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), QueueError> {
        self.inner
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declare {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), QueueError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(args),
            )
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Declare {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declare {
                name: format!("{} -> {}", exchange, queue),
                message: e.to_string(),
            })
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), QueueError> {
        let publish_err = |message: String| QueueError::Publish {
            queue: queue.to_string(),
            message,
        };

        let mut headers = FieldTable::default();
        headers.insert(
            RETRY_HEADER.into(),
            AMQPValue::LongLongInt(i64::from(message.retry_count)),
        );
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_headers(headers);
        if message.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }

        let confirmation = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| publish_err(e.to_string()))?
            .await
            .map_err(|e| publish_err(format!("confirmation failed: {}", e)))?;
        if confirmation.is_nack() {
            return Err(publish_err("broker nacked the publish".to_string()));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError> {
        let consume_err = |message: String| QueueError::Consume {
            queue: queue.to_string(),
            message,
        };
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| consume_err(format!("basic_qos failed: {}", e)))?;
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| consume_err(e.to_string()))?;

        let queue = queue.to_string();
        let stream = consumer.map(move |next| match next {
            Ok(delivery) => Ok(Delivery {
                retry_count: retry_count(delivery.properties.headers().as_ref()),
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.to_string()),
                body: delivery.data,
                acker: Box::new(AmqpAcker {
                    inner: delivery.acker,
                }),
            }),
            Err(e) => Err(QueueError::Consume {
                queue: queue.clone(),
                message: e.to_string(),
            }),
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner
            .close(200, "ticketflow shutdown")
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))
    }
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.inner
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}
