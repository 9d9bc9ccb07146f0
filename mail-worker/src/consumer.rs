//! RabbitMQ consumer wiring for the worker binary.
//!
//! Connects, starts one consumer per registry queue and runs each through
//! `consume_queue` until SIGINT/SIGTERM or until a consumer stops on its own.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use deskmail::{
    consume_queue, Config, ConsumerExit, ConsumerReport, Dispatcher, EmailQueue, Inbound,
    QueueClient, SmtpMailer, TemplateRenderer,
};

/// How the worker came down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Clean,
    Failed,
}

/// Run the worker until shutdown.
///
/// This function:
/// 1. Connects to RabbitMQ and declares every registry queue
/// 2. Sets the per-consumer prefetch
/// 3. Starts a manual-ack consumer for each queue
/// 4. Waits for SIGINT/SIGTERM or for a consumer to stop
/// 5. Cancels consumers, drains in-flight messages and closes the connection
///
/// Startup failures are returned as errors.
pub async fn run(config: Config) -> Result<Shutdown> {
    let client = QueueClient::new(config.amqp.clone(), config.publisher_confirms);

    let tasks = match start(&config, &client).await {
        Ok(tasks) => tasks,
        Err(e) => {
            if let Err(close_err) = client.close().await {
                warn!(error = %close_err, "worker_close_after_startup_failure_failed");
            }
            return Err(e);
        }
    };

    info!("worker_ready");

    stop(client, tasks).await
}

struct Consumers {
    tags: Vec<String>,
    tasks: JoinSet<ConsumerReport>,
    shutdown: watch::Sender<bool>,
}

async fn start(config: &Config, client: &QueueClient) -> Result<Consumers> {
    client.connect().await.context("Failed to connect to RabbitMQ")?;
    client
        .set_prefetch(config.worker_prefetch)
        .await
        .context("Failed to set QoS")?;

    let mailer = SmtpMailer::new(&config.smtp).context("Failed to build SMTP transport")?;
    let renderer = TemplateRenderer::new(&config.template_dir).strict(config.template_strict);
    let dispatcher = Arc::new(
        Dispatcher::new(renderer, Arc::new(mailer), config.smtp.from.clone())
            .with_max_age_ms(config.message_max_age_ms),
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    let mut tags = Vec::new();

    for queue in EmailQueue::ALL {
        let tag = format!("deskmail-{}", queue.name());
        let consumer = client
            .consume(queue, &tag)
            .await
            .with_context(|| format!("Failed to start consumer for {queue}"))?;

        tasks.spawn(consume_queue(
            queue,
            consumer.map(|delivery| delivery.map(Inbound::from)),
            Arc::clone(&dispatcher),
            config.worker_prefetch,
            shutdown_rx.clone(),
        ));
        tags.push(tag);
    }

    Ok(Consumers {
        tags,
        tasks,
        shutdown,
    })
}

async fn stop(client: QueueClient, mut consumers: Consumers) -> Result<Shutdown> {
    let mut status = Shutdown::Clean;
    let mut reports = Vec::new();

    tokio::select! {
        _ = shutdown_signal() => {
            info!("worker_stopping");
        }
        Some(joined) = consumers.tasks.join_next() => {
            error!("worker_consumer_stopped_unexpectedly");
            status = Shutdown::Failed;
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "worker_consumer_panicked"),
            }
        }
    }

    // Stop taking new deliveries, then let in-flight ones settle.
    let _ = consumers.shutdown.send(true);
    for tag in &consumers.tags {
        client.cancel(tag).await;
    }

    while let Some(joined) = consumers.tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(error = %e, "worker_consumer_panicked");
                status = Shutdown::Failed;
            }
        }
    }

    for report in &reports {
        if report.exit == ConsumerExit::StreamClosed {
            warn!(queue = report.queue.name(), "worker_consumer_stream_closed");
            status = Shutdown::Failed;
        }
    }

    if let Err(e) = client.close().await {
        error!(error = %e, "worker_close_failed");
        status = Shutdown::Failed;
    }

    info!(status = ?status, "worker_shutdown_complete");
    Ok(status)
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
