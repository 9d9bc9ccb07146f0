//! Deskmail Enqueue - publish a single email event.
//!
//! Usage:
//!   deskmail-enqueue verify <email> <name>
//!   deskmail-enqueue reset <email>
//!   deskmail-enqueue raw <queue>      (EmailDraft JSON on stdin)
//!
//! Reads only the RABBITMQ_*, PUBLISHER_CONFIRMS and APP_URL variables.

use std::io::Read;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use deskmail::config::{app_url_from_env, publisher_confirms_from_env, AmqpSettings};
use deskmail::outbox::{
    generate_verification_token, password_reset_email, verification_email, EmailDraft,
};
use deskmail::{EmailQueue, OutboxPublisher, QueueClient};

const USAGE: &str = "usage: deskmail-enqueue verify <email> <name> | reset <email> | raw <queue>";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (queue, draft) = draft_from_args(&args)?;

    let client = QueueClient::new(AmqpSettings::from_env(), publisher_confirms_from_env());
    client.connect().await.context("Failed to connect to RabbitMQ")?;

    let outbox = OutboxPublisher::new(client.clone());
    let published = outbox.publish_email_event(queue, draft).await;

    client.close().await.context("Failed to close RabbitMQ connection")?;

    let event = published.map_err(|(_, e)| e).context("Failed to publish event")?;
    info!(
        queue = queue.name(),
        to = %event.email,
        template = %event.template_url,
        timestamp = event.timestamp,
        "enqueue_complete"
    );

    Ok(())
}

fn draft_from_args(args: &[String]) -> Result<(EmailQueue, EmailDraft)> {
    match args {
        [cmd, email, name] if cmd == "verify" => {
            let token = generate_verification_token();
            verification_email(email, name, &app_url_from_env(), &token)
                .context("APP_URL is not a valid URL")
        }
        [cmd, email] if cmd == "reset" => {
            let token = generate_verification_token();
            password_reset_email(email, &app_url_from_env(), &token)
                .context("APP_URL is not a valid URL")
        }
        [cmd, queue] if cmd == "raw" => {
            let Some(queue) = EmailQueue::from_name(queue) else {
                bail!("unknown queue {queue}");
            };

            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read stdin")?;
            let draft: EmailDraft =
                serde_json::from_str(&input).context("stdin is not an EmailDraft")?;

            Ok((queue, draft))
        }
        _ => bail!(USAGE),
    }
}
