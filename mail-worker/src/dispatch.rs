//! Per-message processing for the email worker.
//!
//! Every delivery ends in exactly one of three ways:
//!
//! ```text
//! Received → too old          → ack (discarded, nothing sent)
//!          → rendered + sent  → ack
//!          → decode/render/send failure → reject, no requeue
//! ```
//!
//! The acknowledgement is issued once, after processing has finished.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::mail::{Mailer, OutgoingMail};
use crate::queue::{EmailEvent, EmailQueue};
use crate::template::TemplateRenderer;

/// Default staleness threshold, matching the verification link lifetime.
pub const DEFAULT_MAX_AGE_MS: i64 = 5 * 60 * 1000;

/// Outcome of processing one delivery.
#[derive(Debug)]
pub enum Disposition {
    /// Mail handed to the transport
    Sent,
    /// Older than the staleness threshold; acknowledged without sending
    Discarded { age_ms: i64 },
    /// Unprocessable; rejected without requeue
    Rejected(DispatchError),
}

impl Disposition {
    /// Whether the delivery is removed with an ack (as opposed to a reject).
    pub fn is_ack(&self) -> bool {
        !matches!(self, Disposition::Rejected(_))
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self) -> Result<(), lapin::Error>;

    /// Negatively acknowledge without requeue.
    async fn reject(&self) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn acknowledge(&self) -> Result<(), lapin::Error> {
        self.ack(BasicAckOptions::default()).await
    }

    async fn reject(&self) -> Result<(), lapin::Error> {
        self.nack(BasicNackOptions {
            requeue: false,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl<T: Acknowledger + ?Sized> Acknowledger for Arc<T> {
    async fn acknowledge(&self) -> Result<(), lapin::Error> {
        (**self).acknowledge().await
    }

    async fn reject(&self) -> Result<(), lapin::Error> {
        (**self).reject().await
    }
}

/// Renders and sends the email described by each delivery.
pub struct Dispatcher {
    renderer: TemplateRenderer,
    mailer: Arc<dyn Mailer>,
    from: String,
    max_age_ms: i64,
}

impl Dispatcher {
    pub fn new(
        renderer: TemplateRenderer,
        mailer: Arc<dyn Mailer>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            renderer,
            mailer,
            from: from.into(),
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }

    /// Staleness threshold; negative values are treated as zero.
    pub fn with_max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.max_age_ms = max_age_ms.max(0);
        self
    }

    /// Process a payload against the current wall clock.
    pub async fn process(&self, queue: EmailQueue, data: &[u8]) -> Disposition {
        self.process_at(queue, data, now_ms()).await
    }

    /// Process a payload as if the current time were `now_ms`.
    pub async fn process_at(&self, queue: EmailQueue, data: &[u8], now_ms: i64) -> Disposition {
        let event = match EmailEvent::decode(data) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    queue = queue.name(),
                    error = %e,
                    body_preview = %String::from_utf8_lossy(&data[..data.len().min(500)]),
                    "email_decode_failed"
                );
                return Disposition::Rejected(e.into());
            }
        };

        let age_ms = event.age_ms(now_ms);
        if age_ms > self.max_age_ms {
            warn!(
                queue = queue.name(),
                to = %event.email,
                template = %event.template_url,
                age_ms = age_ms,
                max_age_ms = self.max_age_ms,
                "email_discarded_stale"
            );
            return Disposition::Discarded { age_ms };
        }

        match self.send(&event).await {
            Ok(()) => {
                info!(
                    queue = queue.name(),
                    to = %event.email,
                    template = %event.template_url,
                    age_ms = age_ms,
                    "email_sent"
                );
                Disposition::Sent
            }
            Err(e) => {
                error!(
                    queue = queue.name(),
                    to = %event.email,
                    template = %event.template_url,
                    error = %e,
                    "email_dispatch_failed"
                );
                Disposition::Rejected(e)
            }
        }
    }

    async fn send(&self, event: &EmailEvent) -> Result<(), DispatchError> {
        let html = self.renderer.render(&event.template_url, &event.template_data)?;

        self.mailer
            .send_mail(OutgoingMail {
                from: self.from.clone(),
                to: event.email.clone(),
                subject: event.subject.clone(),
                html,
            })
            .await?;

        Ok(())
    }

    /// Process a delivery and settle it with the broker exactly once.
    pub async fn handle<A: Acknowledger + ?Sized>(
        &self,
        queue: EmailQueue,
        data: &[u8],
        acker: &A,
    ) -> Disposition {
        let disposition = self.process(queue, data).await;
        settle(queue, &disposition, acker).await;
        disposition
    }
}

/// Ack or reject according to `disposition`. Settlement errors are logged only.
pub async fn settle<A: Acknowledger + ?Sized>(
    queue: EmailQueue,
    disposition: &Disposition,
    acker: &A,
) {
    if disposition.is_ack() {
        if let Err(e) = acker.acknowledge().await {
            error!(queue = queue.name(), error = %e, "rabbitmq_ack_failed");
        }
    } else if let Err(e) = acker.reject().await {
        error!(queue = queue.name(), error = %e, "rabbitmq_nack_failed");
    }
}

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
