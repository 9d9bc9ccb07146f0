//! Deskmail Worker - async RabbitMQ consumer for transactional email.
//!
//! Consumes registration and password-reset events from their durable
//! queues, renders the requested template and sends it over SMTP.
//!
//! Exit status: 0 after a clean shutdown, 1 when shutdown failed or a
//! consumer stopped unexpectedly, 2 when startup failed.

mod consumer;

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use deskmail::Config;

const EXIT_SHUTDOWN_FAILURE: u8 = 1;
const EXIT_STARTUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "config_invalid");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    info!(
        rabbitmq_host = %config.amqp.host,
        rabbitmq_url_set = config.amqp.url.is_some(),
        publisher_confirms = config.publisher_confirms,
        prefetch = config.worker_prefetch,
        message_max_age_ms = config.message_max_age_ms,
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        smtp_secure = config.smtp.secure,
        template_dir = %config.template_dir,
        "config_loaded"
    );

    match consumer::run(config).await {
        Ok(consumer::Shutdown::Clean) => ExitCode::SUCCESS,
        Ok(consumer::Shutdown::Failed) => ExitCode::from(EXIT_SHUTDOWN_FAILURE),
        Err(e) => {
            error!(error = format!("{e:#}"), "worker_startup_failed");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}
