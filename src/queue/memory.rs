//! In-process broker with AMQP-like semantics for tests and local runs.
//!
//! Supports durable queues, direct exchanges with bindings, dead-lettering
//! on `nack(requeue=false)`, per-consumer prefetch and connection loss.
//! Message TTL is recorded but not enforced.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::QueueError;

use super::{
    Acker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, OutboundMessage,
    QueueArguments, Transport,
};

/// A message at rest in a memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub retry_count: u32,
    pub correlation_id: Option<String>,
    pub persistent: bool,
}

impl From<OutboundMessage> for StoredMessage {
    fn from(message: OutboundMessage) -> Self {
        Self {
            body: message.body,
            retry_count: message.retry_count,
            correlation_id: message.correlation_id,
            persistent: message.persistent,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryQueue {
    args: QueueArguments,
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct Registry {
    queues: HashMap<String, MemoryQueue>,
    /// exchange -> [(routing key, queue)]
    exchanges: HashMap<String, Vec<(String, String)>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    registry: Mutex<Registry>,
    notify: Notify,
    generation: AtomicU64,
    refuse: AtomicBool,
    connects: AtomicUsize,
    /// Publishes still allowed before every further one fails.
    publish_budget: Mutex<Option<usize>>,
}

impl BrokerState {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, queue: &str, message: StoredMessage, front: bool) -> Result<(), QueueError> {
        {
            let mut registry = self.registry();
            let target = registry
                .queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
            if front {
                target.messages.push_front(message);
            } else {
                target.messages.push_back(message);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn take_publish_slot(&self) -> bool {
        let mut budget = self
            .publish_budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match budget.as_mut() {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        self.registry()
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
    }

    /// Route through the queue's dead-letter exchange; dropped when the
    /// queue has none.
    fn dead_letter(&self, queue: &str, message: StoredMessage) {
        {
            let mut registry = self.registry();
            let Some(args) = registry.queues.get(queue).map(|q| q.args.clone()) else {
                return;
            };
            let Some(exchange) = args.dead_letter_exchange else {
                return;
            };
            let key = args
                .dead_letter_routing_key
                .unwrap_or_else(|| queue.to_string());
            let targets: Vec<String> = registry
                .exchanges
                .get(&exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(routing_key, _)| *routing_key == key)
                        .map(|(_, target)| target.clone())
                        .collect()
                })
                .unwrap_or_default();
            for target in targets {
                if let Some(q) = registry.queues.get_mut(&target) {
                    q.messages.push_back(message.clone());
                }
            }
        }
        self.notify.notify_waiters();
    }
}

/// Shared in-memory broker. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.registry().queues.contains_key(queue)
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        self.state.registry().queues.get(queue).map(|q| q.args.clone())
    }

    /// Number of ready (undelivered) messages.
    pub fn depth(&self, queue: &str) -> usize {
        self.state
            .registry()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .registry()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .registry()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Put a raw message on a queue, bypassing any channel.
    pub fn inject(&self, queue: &str, message: StoredMessage) -> Result<(), QueueError> {
        self.state.push(queue, message, false)
    }

    /// Number of `connect` calls so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Let `limit` more publishes through, then fail the rest until reset
    /// with `None`.
    pub fn limit_publishes(&self, limit: Option<usize>) {
        *self
            .state
            .publish_budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = limit;
    }

    /// Close every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to pile up behind the manager's lock.
        tokio::task::yield_now().await;
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("connection refused".to_string()));
        }
        Ok(Arc::new(MemoryConnection {
            link: ConnLink {
                state: self.state.clone(),
                generation: self.state.generation.load(Ordering::SeqCst),
                closed: Arc::new(AtomicBool::new(false)),
            },
        }))
    }
}

#[derive(Debug, Clone)]
struct ConnLink {
    state: Arc<BrokerState>,
    generation: u64,
    closed: Arc<AtomicBool>,
}

impl ConnLink {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.state.generation.load(Ordering::SeqCst) == self.generation
    }
}

struct MemoryConnection {
    link: ConnLink,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        if !self.link.is_open() {
            return Err(QueueError::Channel("connection is closed".to_string()));
        }
        Ok(Arc::new(MemoryChannel {
            link: self.link.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.link.closed.store(true, Ordering::SeqCst);
        self.link.state.notify.notify_waiters();
        Ok(())
    }
}

#[derive(Clone)]
struct ChannelLink {
    conn: ConnLink,
    closed: Arc<AtomicBool>,
}

impl ChannelLink {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.conn.is_open()
    }

    fn state(&self) -> &BrokerState {
        &self.conn.state
    }
}

struct MemoryChannel {
    link: ConnLink,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn channel_link(&self) -> ChannelLink {
        ChannelLink {
            conn: self.link.clone(),
            closed: self.closed.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.channel_link().is_open() {
            Ok(())
        } else {
            Err(QueueError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.channel_link().is_open()
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.link
            .state
            .registry()
            .exchanges
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut registry = self.link.state.registry();
        match registry.queues.get(name) {
            Some(existing) if existing.args != *args => Err(QueueError::Declare {
                name: name.to_string(),
                message: "PRECONDITION_FAILED - inequivalent arguments".to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                registry.queues.insert(
                    name.to_string(),
                    MemoryQueue {
                        args: args.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut registry = self.link.state.registry();
        if !registry.queues.contains_key(queue) {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        let bindings = registry
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| QueueError::Declare {
                name: exchange.to_string(),
                message: "exchange not declared".to_string(),
            })?;
        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), QueueError> {
        self.ensure_open().map_err(|e| QueueError::Publish {
            queue: queue.to_string(),
            message: e.to_string(),
        })?;
        if !self.link.state.take_publish_slot() {
            return Err(QueueError::Publish {
                queue: queue.to_string(),
                message: "publish rejected".to_string(),
            });
        }
        self.link.state.push(queue, message.into(), false)
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, QueueError> {
        self.ensure_open()?;
        if !self.link.state.registry().queues.contains_key(queue) {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        let permits = if prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            usize::from(prefetch)
        };
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(pump(
            self.channel_link(),
            queue.to_string(),
            Arc::new(Semaphore::new(permits)),
            tx,
        ));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        self.link.state.notify.notify_waiters();
        Ok(())
    }
}

/// Feed deliveries to one consumer while it holds fewer than `prefetch`
/// unsettled ones. Ends (closing the stream) when the channel closes.
async fn pump(
    link: ChannelLink,
    queue: String,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<Result<Delivery, QueueError>>,
) {
    loop {
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = tx.closed() => return,
        };

        let message = loop {
            if !link.is_open() {
                return;
            }
            let notified = link.state().notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(message) = link.state().pop(&queue) {
                break message;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tx.closed() => return,
            }
        };

        let delivery = Delivery {
            body: message.body.clone(),
            retry_count: message.retry_count,
            correlation_id: message.correlation_id.clone(),
            acker: Box::new(MemoryAcker {
                link: link.clone(),
                queue: queue.clone(),
                pending: Mutex::new(Some((message, permit))),
            }),
        };
        if let Err(mpsc::error::SendError(Ok(unsent))) = tx.send(Ok(delivery)).await {
            let _ = unsent.acker.nack(true).await;
            return;
        }
    }
}

struct MemoryAcker {
    link: ChannelLink,
    queue: String,
    pending: Mutex<Option<(StoredMessage, OwnedSemaphorePermit)>>,
}

impl MemoryAcker {
    fn take(&self) -> Result<(StoredMessage, OwnedSemaphorePermit), QueueError> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| QueueError::Ack("delivery already settled".to_string()))
    }

    /// A delivery left unsettled when its channel dies goes back to the
    /// head of the queue.
    fn settle_closed(&self, message: StoredMessage) -> Result<(), QueueError> {
        let _ = self.link.state().push(&self.queue, message, true);
        Err(QueueError::Ack("channel closed before settlement".to_string()))
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        let (message, _permit) = self.take()?;
        if !self.link.is_open() {
            return self.settle_closed(message);
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        let (message, _permit) = self.take()?;
        if !self.link.is_open() {
            return self.settle_closed(message);
        }
        if requeue {
            self.link.state().push(&self.queue, message, true)
        } else {
            self.link.state().dead_letter(&self.queue, message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let conn = broker.connect().await.unwrap();
        conn.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_consume_in_order() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q", &QueueArguments::default()).await.unwrap();
        for body in [b"a".to_vec(), b"b".to_vec()] {
            ch.publish("q", OutboundMessage::persistent(body)).await.unwrap();
        }

        let mut stream = ch.consume("q", 10, "t").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"a");
        assert_eq!(second.body, b"b");
        first.acker.ack().await.unwrap();
        second.acker.ack().await.unwrap();
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_exchange("q.dlx").await.unwrap();
        ch.declare_queue("q.dlq", &QueueArguments::default()).await.unwrap();
        ch.bind_queue("q.dlq", "q.dlx", "q").await.unwrap();
        ch.declare_queue(
            "q",
            &QueueArguments {
                dead_letter_exchange: Some("q.dlx".into()),
                dead_letter_routing_key: Some("q".into()),
                message_ttl_ms: None,
            },
        )
        .await
        .unwrap();
        ch.publish("q", OutboundMessage::persistent(b"x".to_vec()).with_retry_count(3))
            .await
            .unwrap();

        let mut stream = ch.consume("q", 1, "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.acker.nack(false).await.unwrap();

        let dead = broker.messages("q.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 3);
        assert!(delivery.acker.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_prefetch_withholds_until_settled() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q", &QueueArguments::default()).await.unwrap();
        ch.publish("q", OutboundMessage::persistent(b"1".to_vec())).await.unwrap();
        ch.publish("q", OutboundMessage::persistent(b"2".to_vec())).await.unwrap();

        let mut stream = ch.consume("q", 1, "t").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err());

        first.acker.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn test_dropped_connection_ends_stream_and_requeues_unacked() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q", &QueueArguments::default()).await.unwrap();
        ch.publish("q", OutboundMessage::persistent(b"1".to_vec())).await.unwrap();

        let mut stream = ch.consume("q", 1, "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.drop_connections();

        assert!(!ch.is_open());
        assert!(delivery.acker.ack().await.is_err());
        assert_eq!(broker.depth("q"), 1);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_redeclare_with_different_arguments_fails() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q", &QueueArguments::default()).await.unwrap();
        let err = ch
            .declare_queue(
                "q",
                &QueueArguments {
                    message_ttl_ms: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Declare { .. }));
    }

    #[tokio::test]
    async fn test_publish_limit() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.declare_queue("q", &QueueArguments::default()).await.unwrap();
        broker.limit_publishes(Some(1));
        ch.publish("q", OutboundMessage::persistent(b"1".to_vec())).await.unwrap();
        let err = ch
            .publish("q", OutboundMessage::persistent(b"2".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Publish { .. }));

        broker.limit_publishes(None);
        ch.publish("q", OutboundMessage::persistent(b"3".to_vec())).await.unwrap();
        assert_eq!(broker.depth("q"), 2);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        assert!(broker.connect().await.is_err());
        assert_eq!(broker.connect_attempts(), 1);
    }
}
