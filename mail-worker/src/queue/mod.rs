//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The static registry of durable email queues
//! - The `EmailEvent` wire format
//! - A client owning the broker connection and channel
//! - The publishing seam used by the outbox
//!
//! ## Architecture
//!
//! ```text
//! Request handler → commit → Outbox → user-registration / password-reset → Worker → SMTP
//! ```

pub mod client;
pub mod publisher;
pub mod registry;
pub mod types;

pub use client::QueueClient;
pub use publisher::EventPublisher;
pub use registry::EmailQueue;
pub use types::EmailEvent;
