use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::QueueError;

use super::topology::{QueueName, Topology};
use super::{BrokerChannel, BrokerConnection, OutboundMessage, Transport};

#[derive(Default)]
struct Handles {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

/// Owns the process's single broker connection and channel.
///
/// Both are created lazily on first use. Concurrent callers queue on one
/// async mutex held across the connect, so only one connection attempt is
/// ever in flight. A closed or failed handle is dropped and the next caller
/// reconnects; there is no background reconnect loop. Creating a channel
/// (re)declares the whole [`Topology`].
pub struct BrokerManager {
    transport: Arc<dyn Transport>,
    topology: Topology,
    handles: Mutex<Handles>,
}

impl BrokerManager {
    pub fn new(transport: Arc<dyn Transport>, topology: Topology) -> Self {
        Self {
            transport,
            topology,
            handles: Mutex::new(Handles::default()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        let mut handles = self.handles.lock().await;
        self.connection_locked(&mut handles).await
    }

    async fn connection_locked(
        &self,
        handles: &mut Handles,
    ) -> Result<Arc<dyn BrokerConnection>, QueueError> {
        if let Some(conn) = &handles.connection {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            warn!("broker connection closed, reconnecting");
            handles.connection = None;
            handles.channel = None;
        }

        let conn = self.transport.connect().await?;
        info!("broker connection established");
        handles.connection = Some(conn.clone());
        Ok(conn)
    }

    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        let mut handles = self.handles.lock().await;
        if let Some(channel) = &handles.channel {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            debug!("broker channel closed, reopening");
            handles.channel = None;
        }

        let conn = self.connection_locked(&mut handles).await?;
        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                handles.connection = None;
                return Err(e);
            }
        };
        self.topology.declare(channel.as_ref()).await?;
        handles.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Forget the memoized handles so the next caller reconnects.
    pub async fn invalidate(&self) {
        let mut handles = self.handles.lock().await;
        if handles.connection.is_some() || handles.channel.is_some() {
            debug!("broker handles invalidated");
        }
        *handles = Handles::default();
    }

    /// Close channel and connection. Safe to call when never connected.
    pub async fn close(&self) -> Result<(), QueueError> {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        if let Some(channel) = handles.channel {
            channel.close().await?;
        }
        if let Some(conn) = handles.connection {
            conn.close().await?;
            info!("broker connection closed");
        }
        Ok(())
    }

    /// Publish one message. A failed publish invalidates the handles.
    pub async fn publish(&self, queue: QueueName, message: OutboundMessage) -> Result<(), QueueError> {
        let channel = self.channel().await?;
        if let Err(e) = channel.publish(queue.as_str(), message).await {
            self.invalidate().await;
            return Err(e);
        }
        Ok(())
    }

    /// Serialize `payload` as JSON and publish it persistently.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        queue: QueueName,
        payload: &T,
        correlation_id: Option<&str>,
    ) -> Result<(), QueueError> {
        let body = serde_json::to_vec(payload).map_err(QueueError::Encode)?;
        let mut message = OutboundMessage::persistent(body);
        if let Some(id) = correlation_id {
            message = message.with_correlation_id(id);
        }
        self.publish(queue, message).await
    }
}
