use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::errors::QueueError;

use super::connection::BrokerManager;
use super::topology::QueueName;
use super::{Delivery, OutboundMessage};

/// What to do with a delivery once its handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// Republish a copy carrying this attempt number, then ack the original.
    RetryWithAttempt(u32),
    /// `nack(requeue=false)`; the queue's DLX routes it to the DLQ.
    DeadLetter,
    /// `nack(requeue=true)`: back on the queue with the same attempt count.
    Requeue,
}

impl Outcome {
    /// Outcome for a failed handler run at `attempt` (0-based).
    pub fn after_failure(attempt: u32, max_retries: u32) -> Self {
        if attempt < max_retries {
            Outcome::RetryWithAttempt(attempt + 1)
        } else {
            Outcome::DeadLetter
        }
    }
}

/// Handler error that puts the delivery back on its queue as-is instead of
/// counting a failed attempt.
#[derive(Debug, Error)]
#[error("delivery requeued: {0}")]
pub struct Requeue(pub String);

/// Delivery metadata handed to a handler next to the decoded payload.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub queue: QueueName,
    pub attempt: u32,
    pub correlation_id: Option<String>,
}

/// Prefetch-bounded consumer with header-based retry and dead-lettering.
pub struct Consumer {
    manager: Arc<BrokerManager>,
    queue: QueueName,
    prefetch: u16,
    max_retries: u32,
    tag: String,
}

impl Consumer {
    pub fn new(manager: Arc<BrokerManager>, queue: QueueName) -> Self {
        let max_retries = manager.topology().policy(queue).max_retries;
        Self {
            manager,
            queue,
            prefetch: 1,
            max_retries,
            tag: format!("ticketflow-{}-{}", queue, uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Consume until the delivery stream breaks. Each delivery runs on its
    /// own task, so up to `prefetch` handlers run concurrently.
    ///
    /// Always returns an error: the stream only ends when the connection or
    /// channel is lost, and the manager is invalidated before returning so a
    /// restarted consumer reconnects.
    pub async fn run<T, H, Fut>(self, handler: H) -> Result<(), QueueError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let channel = self.manager.channel().await?;
        let mut stream = match channel
            .consume(self.queue.as_str(), self.prefetch, &self.tag)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.manager.invalidate().await;
                return Err(e);
            }
        };
        debug!(queue = %self.queue, prefetch = self.prefetch, "consumer started");

        let handler = Arc::new(handler);
        while let Some(next) = stream.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    self.manager.invalidate().await;
                    return Err(QueueError::Consume {
                        queue: self.queue.to_string(),
                        message: e.to_string(),
                    });
                }
            };
            let span = info_span!("delivery", queue = %self.queue, attempt = delivery.retry_count);
            tokio::spawn(
                process(
                    self.manager.clone(),
                    self.queue,
                    self.max_retries,
                    delivery,
                    handler.clone(),
                )
                .instrument(span),
            );
        }

        self.manager.invalidate().await;
        Err(QueueError::StreamEnded(self.queue.to_string()))
    }
}

async fn process<T, H, Fut>(
    manager: Arc<BrokerManager>,
    queue: QueueName,
    max_retries: u32,
    delivery: Delivery,
    handler: Arc<H>,
) where
    T: DeserializeOwned + Send + 'static,
    H: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let attempt = delivery.retry_count;
    let payload: T = match serde_json::from_slice(&delivery.body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "undecodable payload, dead-lettering");
            if let Err(e) = delivery.acker.nack(false).await {
                error!(error = %e, "failed to dead-letter undecodable payload");
            }
            return;
        }
    };

    let ctx = MessageContext {
        queue,
        attempt,
        correlation_id: delivery.correlation_id.clone(),
    };
    // Run the handler on its own task so a panic still settles the delivery.
    let run = tokio::spawn(async move { (*handler)(payload, ctx).await }.in_current_span());
    let result = match run.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow::anyhow!("handler panicked")),
        Err(e) => Err(anyhow::anyhow!("handler task cancelled: {}", e)),
    };
    let outcome = match result {
        Ok(()) => Outcome::Ack,
        Err(e) if e.is::<Requeue>() => {
            warn!(error = %e, "handler asked for requeue");
            Outcome::Requeue
        }
        Err(e) => {
            let outcome = Outcome::after_failure(attempt, max_retries);
            warn!(error = %format!("{:#}", e), ?outcome, "handler failed");
            outcome
        }
    };

    if let Err(e) = settle(&manager, queue, delivery, outcome).await {
        error!(error = %e, ?outcome, "failed to settle delivery");
    }
}

async fn settle(
    manager: &BrokerManager,
    queue: QueueName,
    delivery: Delivery,
    outcome: Outcome,
) -> Result<(), QueueError> {
    match outcome {
        Outcome::Ack => delivery.acker.ack().await,
        Outcome::RetryWithAttempt(next) => {
            let mut copy = OutboundMessage::persistent(delivery.body.clone()).with_retry_count(next);
            copy.correlation_id = delivery.correlation_id.clone();
            match manager.publish(queue, copy).await {
                Ok(()) => delivery.acker.ack().await,
                // Keep the original rather than lose it.
                Err(e) => {
                    if let Err(nack) = delivery.acker.nack(true).await {
                        warn!(error = %nack, "failed to requeue after retry publish failed");
                    }
                    Err(e)
                }
            }
        }
        Outcome::DeadLetter => delivery.acker.nack(false).await,
        Outcome::Requeue => delivery.acker.nack(true).await,
    }
}
