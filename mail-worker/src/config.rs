//! Configuration module for environment variable parsing.
//!
//! Broker, mail transport and template settings are all read from the
//! environment. Malformed optional values fall back to their defaults with a
//! warning; missing required values are an error.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::ConfigError;

/// RabbitMQ connection settings.
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    /// Full AMQP URI, takes precedence over the individual parts
    pub url: Option<String>,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl AmqpSettings {
    /// Read the `RABBITMQ_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            url: env::var("RABBITMQ_URL").ok().filter(|v| !v.is_empty()),
            user: env::var("RABBITMQ_USER").unwrap_or(defaults.user),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_var("RABBITMQ_PORT", defaults.port),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
        }
    }

    /// Build the AMQP URI, percent-encoding credentials and vhost.
    pub fn uri(&self) -> Result<String, url::ParseError> {
        if let Some(url) = &self.url {
            return Ok(Url::parse(url)?.to_string());
        }

        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))?;
        // Url only rejects credentials on cannot-be-a-base URLs, which amqp:// never is.
        let _ = url.set_username(&self.user);
        let _ = url.set_password(Some(&self.password));
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(&self.vhost);

        Ok(url.to_string())
    }
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: None,
            user: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
        }
    }
}

/// Outbound SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// `true` for implicit TLS, `false` for opportunistic STARTTLS
    pub secure: bool,
    /// Envelope and header from-address
    pub from: String,
    pub timeout: Duration,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub amqp: AmqpSettings,

    /// Wait for broker confirmation on every publish
    pub publisher_confirms: bool,

    /// Maximum number of unacknowledged deliveries per consumer
    pub worker_prefetch: u16,

    /// Events older than this are acknowledged and dropped without sending
    pub message_max_age_ms: i64,

    pub smtp: SmtpSettings,

    /// Public application URL used when building links for templates
    pub app_url: String,

    /// Directory holding the HTML email templates
    pub template_dir: String,

    /// Fail rendering when a template references a missing key
    pub template_strict: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let amqp = AmqpSettings::from_env();

        let smtp = SmtpSettings {
            host: require("SMTP_HOST")?,
            port: parse_var("SMTP_PORT", 587),
            username: require("SMTP_USERNAME")?,
            password: require("SMTP_PASSWORD")?,
            secure: parse_var("SMTP_SECURE", false),
            from: env::var("SMTP_FROM").unwrap_or_else(|_| "noreply@example.com".to_string()),
            timeout: Duration::from_millis(parse_var("SMTP_TIMEOUT_MS", 30_000)),
        };

        let worker_prefetch = parse_var("WORKER_PREFETCH", 1u16);
        if worker_prefetch == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_PREFETCH",
                value: "0".to_string(),
            });
        }

        Ok(Config {
            amqp,
            publisher_confirms: publisher_confirms_from_env(),
            worker_prefetch,
            message_max_age_ms: parse_non_negative("MESSAGE_MAX_AGE_MS", 5 * 60 * 1000)?,
            smtp,
            app_url: app_url_from_env(),
            template_dir: env::var("TEMPLATE_DIR").unwrap_or_else(|_| "templates".to_string()),
            template_strict: parse_var("TEMPLATE_STRICT", false),
        })
    }

    /// Lifetime of verification and reset tokens, matched to the staleness threshold.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.message_max_age_ms).unwrap_or(0))
    }
}

/// Whether publishes wait for broker confirmation.
pub fn publisher_confirms_from_env() -> bool {
    parse_var("PUBLISHER_CONFIRMS", false)
}

/// Public application URL used in email links.
pub fn app_url_from_env() -> String {
    env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// Read a required, non-empty variable.
fn require(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

/// Parse an optional variable, falling back to `default` when unset or invalid.
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// Like `parse_var`, but a negative value is a configuration error.
fn parse_non_negative(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    let value = parse_var(name, default);
    if value < 0 {
        return Err(ConfigError::Invalid {
            var: name,
            value: value.to_string(),
        });
    }
    Ok(value)
}
