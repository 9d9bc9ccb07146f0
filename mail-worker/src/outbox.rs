//! Request-side bridge from committed transactions to the email queues.
//!
//! An email event may only be published once the transaction that created
//! the rows it refers to (user, verification token) has committed. The
//! timestamp is taken after the commit returns, so a worker that sees the
//! event can rely on that data being durable.
//!
//! Publishing is not retried: if the broker is unreachable after commit the
//! event is lost and reported back to the caller as `OutboxError::Publish`.

use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};
use url::Url;

use crate::dispatch::{now_ms, DEFAULT_MAX_AGE_MS};
use crate::error::{OutboxError, QueueError};
use crate::queue::{EmailEvent, EmailQueue, EventPublisher};

/// Default lifetime of a verification or password-reset token.
///
/// Tokens should live exactly as long as the worker's staleness threshold;
/// deployments that change `MESSAGE_MAX_AGE_MS` pass `Config::token_ttl()`
/// to `verification_expiry_ms` instead.
pub const TOKEN_TTL: Duration = Duration::from_millis(DEFAULT_MAX_AGE_MS as u64);

// =============================================================================
// Drafts
// =============================================================================

/// An email event that has not been stamped yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub email: String,
    pub subject: String,
    #[serde(rename = "templateURL")]
    pub template_url: String,
    #[serde(rename = "templateData", default)]
    pub template_data: Map<String, Value>,
}

impl EmailDraft {
    /// Fix the publish time, producing the immutable wire event.
    pub fn stamp(self, timestamp: i64) -> EmailEvent {
        EmailEvent {
            email: self.email,
            subject: self.subject,
            template_url: self.template_url,
            template_data: self.template_data,
            timestamp,
        }
    }
}

/// Account verification email, sent on registration and on resend requests.
pub fn verification_email(
    email: &str,
    first_name: &str,
    app_url: &str,
    token: &str,
) -> Result<(EmailQueue, EmailDraft), url::ParseError> {
    let link = token_link(app_url, "verify-email", email, token)?;

    let mut data = Map::new();
    data.insert("Name".to_string(), Value::String(first_name.to_string()));
    data.insert("VerificationURL".to_string(), Value::String(link));

    Ok((
        EmailQueue::UserRegistration,
        EmailDraft {
            email: email.to_string(),
            subject: "Verify your email address".to_string(),
            template_url: "verify-account".to_string(),
            template_data: data,
        },
    ))
}

/// Password reset email.
pub fn password_reset_email(
    email: &str,
    app_url: &str,
    token: &str,
) -> Result<(EmailQueue, EmailDraft), url::ParseError> {
    let link = token_link(app_url, "forgot-password", email, token)?;

    let mut data = Map::new();
    data.insert("ResetPasswordURL".to_string(), Value::String(link));

    Ok((
        EmailQueue::PasswordReset,
        EmailDraft {
            email: email.to_string(),
            subject: "Reset your password".to_string(),
            template_url: "reset-password".to_string(),
            template_data: data,
        },
    ))
}

/// `{app_url}/{path}?email=..&token=..`
fn token_link(
    app_url: &str,
    path: &str,
    email: &str,
    token: &str,
) -> Result<String, url::ParseError> {
    let mut url = Url::parse(app_url)?;
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .push(path);
    url.query_pairs_mut()
        .append_pair("email", email)
        .append_pair("token", token);
    Ok(url.to_string())
}

// =============================================================================
// Tokens
// =============================================================================

/// 32 random bytes, hex encoded.
pub fn generate_verification_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Expiry instant (epoch ms) for a token issued now and valid for `ttl`.
pub fn verification_expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

// =============================================================================
// Commit-then-publish
// =============================================================================

/// A storage transaction owned by the caller.
#[async_trait]
pub trait Transaction: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn commit(self) -> Result<(), Self::Error>;
}

/// Publishes email events on behalf of request handlers.
pub struct OutboxPublisher<P> {
    publisher: P,
}

impl<P: EventPublisher> OutboxPublisher<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    /// Commit `tx`, then stamp and publish `draft`.
    ///
    /// Nothing is published when the commit fails.
    pub async fn commit_and_publish<T: Transaction>(
        &self,
        tx: T,
        queue: EmailQueue,
        draft: EmailDraft,
    ) -> Result<EmailEvent, OutboxError<T::Error>> {
        if let Err(e) = tx.commit().await {
            error!(queue = queue.name(), to = %draft.email, error = %e, "outbox_commit_failed");
            return Err(OutboxError::Commit(e));
        }

        self.publish_email_event(queue, draft)
            .await
            .map_err(|(event, source)| OutboxError::Publish {
                queue,
                event: Box::new(event),
                source,
            })
    }

    /// Stamp and publish `draft`. The caller must already have committed.
    pub async fn publish_email_event(
        &self,
        queue: EmailQueue,
        draft: EmailDraft,
    ) -> Result<EmailEvent, (EmailEvent, QueueError)> {
        let event = draft.stamp(now_ms());

        match self.publisher.publish_email_event(queue, &event).await {
            Ok(()) => {
                info!(queue = queue.name(), to = %event.email, "outbox_published");
                Ok(event)
            }
            Err(e) => {
                error!(
                    queue = queue.name(),
                    to = %event.email,
                    error = %e,
                    "outbox_publish_failed_event_lost"
                );
                Err((event, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(EmailQueue, EmailEvent)>>,
        fail: bool,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish_email_event(
            &self,
            queue: EmailQueue,
            event: &EmailEvent,
        ) -> Result<(), QueueError> {
            if self.fail {
                return Err(QueueError::NotInitialized);
            }
            self.published.lock().unwrap().push((queue, event.clone()));
            Ok(())
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("write conflict")]
    struct WriteConflict;

    /// Records when it committed.
    struct FakeTransaction {
        committed_at: Arc<AtomicI64>,
        fail: bool,
    }

    #[async_trait]
    impl Transaction for FakeTransaction {
        type Error = WriteConflict;

        async fn commit(self) -> Result<(), WriteConflict> {
            if self.fail {
                return Err(WriteConflict);
            }
            self.committed_at.store(now_ms(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn draft() -> (EmailQueue, EmailDraft) {
        verification_email("ada@example.com", "Ada", "http://localhost:3000", "abc").unwrap()
    }

    #[tokio::test]
    async fn test_event_stamped_after_commit() {
        let outbox = OutboxPublisher::new(RecordingPublisher::default());
        let committed_at = Arc::new(AtomicI64::new(0));
        let tx = FakeTransaction {
            committed_at: committed_at.clone(),
            fail: false,
        };

        let (queue, draft) = draft();
        let event = outbox.commit_and_publish(tx, queue, draft).await.unwrap();

        assert!(committed_at.load(Ordering::SeqCst) > 0);
        assert!(event.timestamp >= committed_at.load(Ordering::SeqCst));

        let published = outbox.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, EmailQueue::UserRegistration);
        assert_eq!(published[0].1, event);
    }

    #[tokio::test]
    async fn test_failed_commit_publishes_nothing() {
        let outbox = OutboxPublisher::new(RecordingPublisher::default());
        let tx = FakeTransaction {
            committed_at: Arc::new(AtomicI64::new(0)),
            fail: true,
        };

        let (queue, draft) = draft();
        let result = outbox.commit_and_publish(tx, queue, draft).await;

        assert!(matches!(result, Err(OutboxError::Commit(WriteConflict))));
        assert!(outbox.publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_after_commit_returns_lost_event() {
        let outbox = OutboxPublisher::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let tx = FakeTransaction {
            committed_at: Arc::new(AtomicI64::new(0)),
            fail: false,
        };

        let (queue, draft) = draft();
        let result = outbox.commit_and_publish(tx, queue, draft).await;

        match result {
            Err(OutboxError::Publish { queue, event, .. }) => {
                assert_eq!(queue, EmailQueue::UserRegistration);
                assert_eq!(event.email, "ada@example.com");
            }
            other => panic!("expected publish failure, got {other:?}"),
        }
    }

    #[test]
    fn test_verification_email() {
        let (queue, draft) = draft();

        assert_eq!(queue, EmailQueue::UserRegistration);
        assert_eq!(draft.subject, "Verify your email address");
        assert_eq!(draft.template_url, "verify-account");
        assert_eq!(draft.template_data["Name"], "Ada");
        assert_eq!(
            draft.template_data["VerificationURL"],
            "http://localhost:3000/verify-email?email=ada%40example.com&token=abc"
        );
    }

    #[test]
    fn test_password_reset_email_keeps_base_path() {
        let (queue, draft) =
            password_reset_email("bob@example.com", "https://help.example.com/app/", "xyz").unwrap();

        assert_eq!(queue, EmailQueue::PasswordReset);
        assert_eq!(draft.subject, "Reset your password");
        assert_eq!(
            draft.template_data["ResetPasswordURL"],
            "https://help.example.com/app/forgot-password?email=bob%40example.com&token=xyz"
        );
    }

    #[test]
    fn test_invalid_app_url() {
        assert!(password_reset_email("bob@example.com", "not a url", "xyz").is_err());
    }

    #[test]
    fn test_generate_verification_token() {
        let a = generate_verification_token();
        let b = generate_verification_token();

        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_verification_expiry_matches_staleness_threshold() {
        let before = now_ms();
        let expiry = verification_expiry_ms(TOKEN_TTL);
        assert!(expiry - before >= DEFAULT_MAX_AGE_MS);
        assert!(expiry - before < DEFAULT_MAX_AGE_MS + 1_000);
    }

    #[test]
    fn test_verification_expiry_follows_configured_ttl() {
        let before = now_ms();
        let expiry = verification_expiry_ms(Duration::from_millis(60_000));
        assert!(expiry - before >= 60_000);
        assert!(expiry - before < 61_000);
    }
}
