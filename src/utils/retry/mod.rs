//! Retry utilities: backoff builders for transient failures.
//!
//! Uses `backon` for exponential backoff with jitter. Finder queries retry
//! transient network errors a bounded number of times; nothing else retries.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::FinderSettings;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Maximum number of attempts, including the first one.
    pub max_attempts: usize,
    /// Randomise delays to avoid synchronised retries across peers.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_finders()
    }
}

impl RetryConfig {
    /// Retry policy for finder queries.
    ///
    /// - Base delay: 500ms
    /// - Max delay: 5s
    /// - Max attempts: 3
    /// - Jitter enabled
    pub fn for_finders() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            max_attempts: 3,
            jitter: true,
        }
    }

    /// Same policy without jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Number of retries after the first attempt.
    pub fn max_retries(&self) -> usize {
        self.max_attempts.saturating_sub(1)
    }

    /// Build the `backon` backoff for this policy.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries());
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

impl From<&FinderSettings> for RetryConfig {
    fn from(settings: &FinderSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.retry_base_ms),
            max_attempts: settings.retry_attempts.max(1),
            ..Self::for_finders()
        }
    }
}

#[cfg(test)]
mod tests;
