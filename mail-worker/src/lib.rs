//! Deskmail - transactional email pipeline for the helpdesk backend.
//!
//! This library provides the pieces shared by the two binaries:
//! - `deskmail-worker`: consumes email events, renders templates and sends mail
//! - `deskmail-enqueue`: publishes a single event, for smoke testing
//!
//! Request handlers use the [`outbox`] module to publish an event only after
//! their database transaction has committed.
//!
//! ## Architecture
//!
//! ```text
//! Handler → commit → OutboxPublisher → RabbitMQ → consume_queue → Dispatcher → SMTP
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod mail;
pub mod outbox;
pub mod queue;
pub mod template;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{Acknowledger, Dispatcher, Disposition};
pub use mail::{Mailer, OutgoingMail, SmtpMailer};
pub use outbox::{EmailDraft, OutboxPublisher, Transaction};
pub use queue::{EmailEvent, EmailQueue, EventPublisher, QueueClient};
pub use template::TemplateRenderer;
pub use worker::{consume_queue, ConsumerExit, ConsumerReport, Inbound};
