use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;

use super::config::ReconnectConfig;

/// Retry budget and delay schedule for re-establishing a dropped connection.
///
/// Each call to [`ReconnectPolicy::next_delay`] consumes one attempt. Once
/// `max_attempts` have been handed out, it returns `None` and the connection is
/// considered lost.
#[derive(Debug)]
pub struct ReconnectPolicy {
    max_attempts: Option<u32>,
    attempt: u32,
    backoff: ExponentialBackoff,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            attempt: 0,
            backoff: config.into(),
        }
    }

    /// Delay to wait before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && self.attempt >= max
        {
            return None;
        }

        let delay = self.backoff.next_backoff()?;
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Number of attempts handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restore the full budget after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.backoff.reset();
    }
}
