//! Error types for the email pipeline.
//!
//! Startup failures (`ConfigError`, `QueueError`) abort the process. Everything
//! under `DispatchError` is contained to a single message: the worker logs it
//! and rejects the delivery without requeue.

use thiserror::Error;

/// Configuration could not be loaded from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Broker-side failures raised by the queue client.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid broker URI")]
    InvalidUri(#[source] url::ParseError),

    #[error("failed to connect to RabbitMQ")]
    Connection(#[source] lapin::Error),

    #[error("failed to open channel")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare queue {queue}")]
    Declare {
        queue: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to set prefetch")]
    Qos(#[source] lapin::Error),

    #[error("failed to start consumer on {queue}")]
    Consume {
        queue: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("RabbitMQ channel not initialized")]
    NotInitialized,

    #[error("failed to encode event")]
    Encode(#[source] serde_json::Error),

    #[error("failed to publish to {queue}")]
    Publish {
        queue: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("broker rejected publish to {queue}")]
    PublishNacked { queue: &'static str },

    #[error("error closing RabbitMQ connection: {0}")]
    Close(String),
}

/// A delivery payload that is not a usable `EmailEvent`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event payload")]
    Json(#[from] serde_json::Error),

    #[error("event field {0} is empty")]
    MissingField(&'static str),
}

/// Template lookup or rendering failed.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {id}")]
    NotFound { id: String },

    #[error("template {id} is malformed")]
    Syntax {
        id: String,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    #[error("failed to render template {id}")]
    Render {
        id: String,
        #[source]
        source: Box<handlebars::RenderError>,
    },

    #[error("failed to read template {id}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// The mail transport refused or failed to deliver a message.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid mailbox {address}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("failed to build message")]
    Build(#[source] lettre::error::Error),

    #[error("SMTP transport failed")]
    Transport(#[source] lettre::transport::smtp::Error),
}

/// Why a single delivery could not be processed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// The commit-then-publish sequence failed.
#[derive(Debug, Error)]
pub enum OutboxError<E>
where
    E: std::error::Error + 'static,
{
    /// Nothing was published.
    #[error("transaction commit failed")]
    Commit(#[source] E),

    /// The transaction is committed but its event never reached the broker.
    #[error("event for {queue} lost after commit")]
    Publish {
        queue: crate::queue::EmailQueue,
        event: Box<crate::queue::EmailEvent>,
        #[source]
        source: QueueError,
    },
}
