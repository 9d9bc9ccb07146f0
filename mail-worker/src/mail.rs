//! Outbound mail transport.
//!
//! The worker only needs one operation from the transport: deliver an HTML
//! message. `SmtpMailer` implements it over lettre's async SMTP client;
//! tests substitute their own `Mailer`.

use async_trait::async_trait;
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::SmtpSettings;
use crate::error::SendError;

/// A rendered email ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl OutgoingMail {
    /// Build the RFC 5322 message, validating both mailboxes.
    pub fn to_message(&self) -> Result<Message, SendError> {
        Message::builder()
            .from(parse_mailbox(&self.from)?)
            .to(parse_mailbox(&self.to)?)
            .subject(self.subject.as_str())
            .singlepart(SinglePart::html(self.html.clone()))
            .map_err(SendError::Build)
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, SendError> {
    address.parse().map_err(|source| SendError::Address {
        address: address.to_string(),
        source,
    })
}

/// Delivers rendered email.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_mail(&self, mail: OutgoingMail) -> Result<(), SendError>;
}

/// SMTP transport shared by every consumer.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Build the transport. No connection is made until the first send.
    pub fn new(settings: &SmtpSettings) -> Result<Self, SendError> {
        let builder = if settings.secure {
            debug!(host = %settings.host, "smtp_implicit_tls");
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
                .map_err(SendError::Transport)?
        } else {
            debug!(host = %settings.host, "smtp_opportunistic_starttls");
            let tls = TlsParameters::new(settings.host.clone()).map_err(SendError::Transport)?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
                .tls(Tls::Opportunistic(tls))
        };

        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .timeout(Some(settings.timeout))
            .build();

        Ok(Self { transport })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_mail(&self, mail: OutgoingMail) -> Result<(), SendError> {
        let message = mail.to_message()?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(SendError::Transport)?;

        info!(
            to = %mail.to,
            subject = %mail.subject,
            smtp_code = %response.code(),
            "smtp_accepted"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail(to: &str) -> OutgoingMail {
        OutgoingMail {
            from: "noreply@example.com".to_string(),
            to: to.to_string(),
            subject: "Verify your email address".to_string(),
            html: "<p>Hello</p>".to_string(),
        }
    }

    #[test]
    fn test_to_message_valid() {
        let message = mail("a@b.com").to_message().unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("To: a@b.com"));
        assert!(raw.contains("Subject: Verify your email address"));
        assert!(raw.contains("Content-Type: text/html"));
    }

    #[test]
    fn test_to_message_invalid_recipient() {
        let result = mail("not-an-address").to_message();
        assert!(matches!(
            result,
            Err(SendError::Address { address, .. }) if address == "not-an-address"
        ));
    }

    #[test]
    fn test_to_message_invalid_sender() {
        let mut mail = mail("a@b.com");
        mail.from = "".to_string();
        assert!(matches!(mail.to_message(), Err(SendError::Address { .. })));
    }
}
