//! Wire format of the email queues.
//!
//! Every email queue carries the same JSON-encoded `EmailEvent`. The field
//! names (`templateURL`, `templateData`) are shared with the request-side
//! publishers and must not change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Transactional email request published after a database commit.
///
/// The worker only ever reads an event; each delivery is a fresh decode of
/// the wire bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailEvent {
    /// Recipient address
    pub email: String,
    pub subject: String,
    /// Template identifier, resolved by the template renderer
    #[serde(rename = "templateURL")]
    pub template_url: String,
    /// Substitution values handed to the template
    #[serde(rename = "templateData", default)]
    pub template_data: Map<String, Value>,
    /// Epoch milliseconds, stamped by the publisher after commit
    pub timestamp: i64,
}

impl EmailEvent {
    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and validate a delivery payload.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let event: EmailEvent = serde_json::from_slice(data)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.email.trim().is_empty() {
            return Err(DecodeError::MissingField("email"));
        }
        if self.template_url.trim().is_empty() {
            return Err(DecodeError::MissingField("templateURL"));
        }
        Ok(())
    }

    /// Milliseconds elapsed between publish and `now_ms`.
    ///
    /// Negative when the publisher's clock runs ahead of ours.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }
}
