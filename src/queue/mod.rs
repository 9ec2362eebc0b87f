//! Broker layer: connection management, topology, consumers and the
//! transports they run on.
//!
//! Everything above this module talks to [`BrokerManager`] and
//! [`Consumer`]; the [`Transport`] seam lets tests swap the AMQP client for
//! [`memory::MemoryBroker`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::QueueError;

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod messages;
pub mod topology;

pub use connection::BrokerManager;
pub use consumer::{Consumer, MessageContext, Outcome, Requeue};
pub use topology::{QueueName, Topology};

/// Header carrying the number of times a message has been retried.
pub const RETRY_HEADER: &str = "x-retry-count";

/// Optional `x-*` arguments for a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub retry_count: u32,
    pub correlation_id: Option<String>,
    /// Delivery mode 2
    pub persistent: bool,
}

impl OutboundMessage {
    pub fn persistent(body: Vec<u8>) -> Self {
        Self {
            body,
            retry_count: 0,
            correlation_id: None,
            persistent: true,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Settles one delivery. Exactly one of `ack`/`nack` should be called.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
    async fn nack(&self, requeue: bool) -> Result<(), QueueError>;
}

pub struct Delivery {
    pub body: Vec<u8>,
    /// Value of [`RETRY_HEADER`], 0 when absent
    pub retry_count: u32,
    pub correlation_id: Option<String>,
    pub acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("retry_count", &self.retry_count)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError>;
    async fn close(&self) -> Result<(), QueueError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare a durable direct exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), QueueError>;

    /// Declare a durable queue.
    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), QueueError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError>;

    /// Publish to `queue` through the default exchange and wait for the
    /// broker to confirm.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), QueueError>;

    /// Start consuming with at most `prefetch` unsettled deliveries.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}
