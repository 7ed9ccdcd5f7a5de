//! Reconnect Backoff

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential reconnect delay with a ceiling.
///
/// The delay resets to its initial value once a session streams for at
/// least `reset_after`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    factor: f64,
    reset_after: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl ReconnectPolicy {
    /// Creates a new `ReconnectPolicy` with the given parameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use ntrip_relay::supervisor::ReconnectPolicy;
    /// use std::time::Duration;
    /// let mut policy = ReconnectPolicy::new(
    ///     Duration::from_secs(1),
    ///     Duration::from_secs(30),
    ///     2.0,
    ///     Duration::from_secs(10),
    /// );
    /// assert_eq!(policy.next_delay(), Duration::from_secs(1));
    /// assert_eq!(policy.next_delay(), Duration::from_secs(2));
    /// ```
    #[must_use]
    pub fn new(initial: Duration, max: Duration, factor: f64, reset_after: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            factor: factor.max(1.0),
            reset_after,
            current: initial,
            consecutive_failures: 0,
        }
    }

    /// Create a policy from configuration
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            config.initial_delay,
            config.max_delay,
            config.multiplier,
            config.reset_after,
        )
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    /// Delay before the next attempt; advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let current_ns = self.current.as_nanos().min(u128::from(u64::MAX)) as u64;
        let max_ns = self.max.as_nanos().min(u128::from(u64::MAX)) as u64;
        let next_ns = (current_ns as f64 * self.factor).min(max_ns as f64) as u64;
        self.current = Duration::from_nanos(next_ns).min(self.max).max(delay);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        delay
    }

    /// Account for a streaming period that just ended
    pub fn on_session_end(&mut self, streamed_for: Duration) {
        if streamed_for >= self.reset_after {
            self.reset();
        }
    }

    /// Reset the policy to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
