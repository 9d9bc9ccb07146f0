//! RabbitMQ client owning one connection and one channel.
//!
//! The client is created unconnected and explicitly opened by the process's
//! top-level composition. Publishing or consuming before `connect` fails with
//! `QueueError::NotInitialized`; nothing reconnects behind the caller's back.

use std::future::Future;
use std::sync::Arc;

use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::registry::EmailQueue;
use crate::config::AmqpSettings;
use crate::error::QueueError;

/// AMQP delivery mode for messages persisted to disk.
const PERSISTENT: u8 = 2;

/// Shared handle to the broker connection.
///
/// Cloning is cheap; all clones share the same connection and channel.
#[derive(Clone)]
pub struct QueueClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: AmqpSettings,
    publisher_confirms: bool,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl QueueClient {
    /// Create an unconnected client.
    pub fn new(settings: AmqpSettings, publisher_confirms: bool) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                settings,
                publisher_confirms,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Connect, open the channel and declare every registry queue as durable.
    ///
    /// Calling this on an already connected client returns the existing
    /// channel. A declaration whose properties conflict with an existing
    /// queue fails; callers are expected to abort startup.
    pub async fn connect(&self) -> Result<Channel, QueueError> {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.as_ref() {
            return Ok(ch.clone());
        }

        let uri = self.inner.settings.uri().map_err(QueueError::InvalidUri)?;

        info!(host = %self.inner.settings.host, "rabbitmq_connecting");

        let conn = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(QueueError::Connection)?;

        info!("rabbitmq_connected");

        let ch = conn.create_channel().await.map_err(QueueError::Channel)?;

        if self.inner.publisher_confirms {
            ch.confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(QueueError::Channel)?;
            info!("rabbitmq_confirms_enabled");
        }

        for queue in EmailQueue::ALL {
            ch.queue_declare(
                queue.name(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| QueueError::Declare {
                queue: queue.name(),
                source,
            })?;

            info!(
                queue = queue.name(),
                description = queue.description(),
                "rabbitmq_queue_declared"
            );
        }

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// The channel opened by `connect`.
    pub async fn channel(&self) -> Result<Channel, QueueError> {
        self.inner
            .channel
            .read()
            .await
            .clone()
            .ok_or(QueueError::NotInitialized)
    }

    /// Limit unacknowledged deliveries outstanding per consumer.
    pub async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        let channel = self.channel().await?;
        channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(QueueError::Qos)?;

        info!(prefetch_count = count, "rabbitmq_qos_set");
        Ok(())
    }

    /// Start a manual-acknowledgment consumer on `queue`.
    pub async fn consume(
        &self,
        queue: EmailQueue,
        consumer_tag: &str,
    ) -> Result<Consumer, QueueError> {
        let channel = self.channel().await?;
        let consumer = channel
            .basic_consume(
                queue.name(),
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| QueueError::Consume {
                queue: queue.name(),
                source,
            })?;

        info!(queue = queue.name(), consumer_tag = consumer_tag, "rabbitmq_consumer_started");
        Ok(consumer)
    }

    /// Ask the broker to stop delivering to `consumer_tag`.
    pub async fn cancel(&self, consumer_tag: &str) {
        let channel = match self.channel().await {
            Ok(ch) => ch,
            Err(_) => return,
        };

        if let Err(e) = channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(consumer_tag = consumer_tag, error = %e, "rabbitmq_cancel_failed");
        }
    }

    /// Publish a persistent JSON message.
    ///
    /// Without publisher confirms this returns once the frame is handed to
    /// the connection. With confirms enabled it waits for the broker and
    /// fails on a nack.
    pub async fn publish(&self, queue: EmailQueue, body: &[u8]) -> Result<(), QueueError> {
        let channel = self.channel().await?;

        let confirm = channel
            .basic_publish(
                "",
                queue.name(),
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|source| QueueError::Publish {
                queue: queue.name(),
                source,
            })?;

        if self.inner.publisher_confirms {
            let confirmation = confirm.await.map_err(|source| QueueError::Publish {
                queue: queue.name(),
                source,
            })?;

            if confirmation.is_nack() {
                return Err(QueueError::PublishNacked {
                    queue: queue.name(),
                });
            }
        }

        info!(queue = queue.name(), body_length = body.len(), "rabbitmq_published");
        Ok(())
    }

    /// Close the channel, then the connection.
    ///
    /// Both are attempted even if the first fails. Errors are logged and
    /// summarised in the returned error.
    pub async fn close(&self) -> Result<(), QueueError> {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        let channel = channel.take();
        let connection = connection.take();

        close_in_order(
            channel.as_ref().map(|ch| ch.close(200, "Normal shutdown")),
            connection.as_ref().map(|conn| conn.close(200, "Normal shutdown")),
        )
        .await
    }
}

/// Await the channel close, then the connection close, whatever the first returned.
async fn close_in_order<C, K>(channel: Option<C>, connection: Option<K>) -> Result<(), QueueError>
where
    C: Future<Output = Result<(), lapin::Error>>,
    K: Future<Output = Result<(), lapin::Error>>,
{
    let mut failures = Vec::new();

    if let Some(close) = channel {
        if let Err(e) = close.await {
            error!(error = %e, "rabbitmq_channel_close_error");
            failures.push(format!("channel: {e}"));
        }
    }

    if let Some(close) = connection {
        if let Err(e) = close.await {
            error!(error = %e, "rabbitmq_connection_close_error");
            failures.push(format!("connection: {e}"));
        }
    }

    if failures.is_empty() {
        info!("rabbitmq_closed");
        Ok(())
    } else {
        Err(QueueError::Close(failures.join("; ")))
    }
}
