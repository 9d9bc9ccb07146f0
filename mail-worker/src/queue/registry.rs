//! Static registry of the email queues.
//!
//! Every queue listed here is declared durable at connect time and gets
//! exactly one consumer in the worker.

use std::fmt;

/// A named email queue, selected by business purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmailQueue {
    UserRegistration,
    PasswordReset,
}

impl EmailQueue {
    /// All registered queues, in declaration order.
    pub const ALL: [EmailQueue; 2] = [EmailQueue::UserRegistration, EmailQueue::PasswordReset];

    /// Broker-side queue name.
    pub const fn name(self) -> &'static str {
        match self {
            EmailQueue::UserRegistration => "user-registration",
            EmailQueue::PasswordReset => "password-reset",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            EmailQueue::UserRegistration => {
                "This queue handles all emails sent when a user creates an account"
            }
            EmailQueue::PasswordReset => {
                "This queue handles all emails sent when a user requests a password reset"
            }
        }
    }

    /// Look up a queue by its broker-side name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.name() == name)
    }
}

impl fmt::Display for EmailQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        assert_eq!(EmailQueue::UserRegistration.name(), "user-registration");
        assert_eq!(EmailQueue::PasswordReset.name(), "password-reset");
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            EmailQueue::from_name("password-reset"),
            Some(EmailQueue::PasswordReset)
        );
        assert_eq!(EmailQueue::from_name("account-deletion"), None);
    }

    #[test]
    fn test_registry_names_are_unique() {
        let mut names: Vec<_> = EmailQueue::ALL.iter().map(|q| q.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EmailQueue::ALL.len());
    }
}
