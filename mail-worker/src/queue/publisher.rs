//! Publishing `EmailEvent`s onto the email queues.

use async_trait::async_trait;
use tracing::info;

use super::client::QueueClient;
use super::registry::EmailQueue;
use super::types::EmailEvent;
use crate::error::QueueError;

/// Anything that can put an email event on a queue.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_email_event(
        &self,
        queue: EmailQueue,
        event: &EmailEvent,
    ) -> Result<(), QueueError>;
}

#[async_trait]
impl EventPublisher for QueueClient {
    async fn publish_email_event(
        &self,
        queue: EmailQueue,
        event: &EmailEvent,
    ) -> Result<(), QueueError> {
        let body = event.encode().map_err(QueueError::Encode)?;
        self.publish(queue, &body).await?;

        info!(
            queue = queue.name(),
            to = %event.email,
            template = %event.template_url,
            timestamp = event.timestamp,
            "email_event_published"
        );

        Ok(())
    }
}
