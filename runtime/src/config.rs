//! Engine-wide consumer configuration.
//!
//! Subscriptions inherit these values unless their registration overrides
//! them. [`ConsumerConfig::from_env`] loads them from environment variables:
//!
//! | Variable                    | Default  |
//! |-----------------------------|----------|
//! | `DEFAULT_SUBSCRIPTION_NAME` | required |
//! | `MAX_MESSAGE_COUNT`         | `10`     |
//! | `MAX_WAIT_TIME_SECS`        | `30`     |
//! | `MAX_LOCK_RENEWAL_SECS`     | `300`    |

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default number of messages pulled per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

/// Default wait for the first message of a batch.
pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_secs(30);

/// Default upper bound on automatic lock renewal per message.
pub const DEFAULT_MAX_LOCK_RENEWAL: Duration = Duration::from_secs(300);

/// Engine-wide defaults for every subscription.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Subscription used when a registration does not name one
    pub default_subscription_name: String,
    /// Maximum number of messages per batch
    pub max_batch_size: usize,
    /// Maximum wait for a batch
    pub max_wait_time: Duration,
    /// Maximum total lock renewal per message
    pub max_lock_renewal: Duration,
    /// Backoff for failed batch receives
    pub receive_retry: RetryPolicy,
}

impl ConsumerConfig {
    /// Create a configuration with default limits.
    #[must_use]
    pub fn new(default_subscription_name: impl Into<String>) -> Self {
        Self {
            default_subscription_name: default_subscription_name.into(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_wait_time: DEFAULT_MAX_WAIT_TIME,
            max_lock_renewal: DEFAULT_MAX_LOCK_RENEWAL,
            receive_retry: RetryPolicy::default(),
        }
    }

    /// Load the configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DEFAULT_SUBSCRIPTION_NAME` is unset
    /// and [`ConfigError::Invalid`] if a value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the configuration through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Same as [`ConsumerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = lookup("DEFAULT_SUBSCRIPTION_NAME")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DEFAULT_SUBSCRIPTION_NAME"))?;

        let mut config = Self::new(name.trim());
        if let Some(count) = parse_var::<usize>(&lookup, "MAX_MESSAGE_COUNT")? {
            config = config.with_max_batch_size(count);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MAX_WAIT_TIME_SECS")? {
            config = config.with_max_wait_time(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MAX_LOCK_RENEWAL_SECS")? {
            config = config.with_max_lock_renewal(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the maximum batch size
    #[must_use]
    pub const fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Set the maximum batch wait
    #[must_use]
    pub const fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    /// Set the maximum lock renewal
    #[must_use]
    pub const fn with_max_lock_renewal(mut self, max_lock_renewal: Duration) -> Self {
        self.max_lock_renewal = max_lock_renewal;
        self
    }

    /// Set the receive retry policy
    #[must_use]
    pub fn with_receive_retry(mut self, policy: RetryPolicy) -> Self {
        self.receive_retry = policy;
        self
    }

    /// Check the limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty subscription name or a
    /// zero batch size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_subscription_name.is_empty() {
            return Err(ConfigError::Invalid {
                key: "DEFAULT_SUBSCRIPTION_NAME",
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_MESSAGE_COUNT",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}
