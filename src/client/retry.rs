//! Reconnection backoff.

use std::time::Duration;

use crate::error::{Error, Result};

/// Backoff configuration for reconnecting a failed stream.
///
/// Delays grow exponentially from `initial_backoff` up to `max_backoff`,
/// with `jitter` applied as a random fraction of each delay. The sequence
/// restarts once a stream has seen at least one response.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first reconnection attempt. Default: 1 second.
    pub initial_backoff: Duration,
    /// Upper bound on the delay. Default: 120 seconds.
    pub max_backoff: Duration,
    /// Growth factor applied after each attempt. Default: 1.6.
    pub backoff_multiplier: f64,
    /// Random perturbation, as a fraction of the delay (0.2 means ±20%).
    /// Default: 0.2.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Assemble and validate a policy.
    ///
    /// # Errors
    ///
    /// Rejects a zero `initial_backoff`, a `max_backoff` below
    /// `initial_backoff`, a multiplier below 1.0, and a jitter outside
    /// `[0.0, 1.0)`.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_ads::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(
    ///     Duration::from_millis(500),
    ///     Duration::from_secs(60),
    ///     2.0,
    ///     0.1,
    /// )?;
    /// # Ok::<(), xds_ads::Error>(())
    /// ```
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        jitter: f64,
    ) -> Result<Self> {
        let policy = Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter,
        };
        policy.check()?;
        Ok(policy)
    }

    fn check(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::Validation(format!(
                "max_backoff ({:?}) must be >= initial_backoff ({:?})",
                self.max_backoff, self.initial_backoff
            )));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Validation(format!(
                "jitter must be in [0.0, 1.0), got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            backoff_multiplier: 1.6,
            jitter: 0.2,
        }
    }
}

/// Tracks the delay to apply before the next reconnection attempt.
///
/// # Example
///
/// ```
/// use xds_ads::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let mut policy = RetryPolicy::default();
/// policy.jitter = 0.0;
/// let mut backoff = Backoff::new(policy);
///
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(1600));
///
/// // After a working stream, the sequence starts over.
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    delay: Duration,
}

impl Backoff {
    /// Start a backoff sequence at the policy's initial delay.
    pub fn new(policy: RetryPolicy) -> Self {
        let delay = policy.initial_backoff;
        Self { policy, delay }
    }

    /// The delay to wait before the next attempt. Advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.delay;
        self.delay = self
            .delay
            .mul_f64(self.policy.backoff_multiplier)
            .min(self.policy.max_backoff);
        if self.policy.jitter == 0.0 {
            return base;
        }
        base.mul_f64(1.0 + rand::random_range(-self.policy.jitter..self.policy.jitter))
    }

    /// Restart the sequence from the initial delay.
    pub fn reset(&mut self) {
        self.delay = self.policy.initial_backoff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let mut policy = RetryPolicy::default();
        policy.jitter = 0.0;
        let mut backoff = Backoff::new(policy.clone());
        let mut last = Duration::ZERO;
        for _ in 0..32 {
            let next = backoff.next_delay();
            assert!(next >= last);
            last = next;
        }
        assert_eq!(last, policy.max_backoff);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let mut backoff = Backoff::new(policy.clone());
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= policy.initial_backoff.mul_f64(1.0 - policy.jitter));
            assert!(delay <= policy.max_backoff.mul_f64(1.0 + policy.jitter));
        }
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(800) && delay <= Duration::from_millis(1200));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let valid = RetryPolicy::default();
        assert!(RetryPolicy::new(Duration::ZERO, valid.max_backoff, 1.6, 0.2).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(1), 1.6, 0.2).is_err());
        assert!(RetryPolicy::new(valid.initial_backoff, valid.max_backoff, 0.5, 0.2).is_err());
        assert!(RetryPolicy::new(valid.initial_backoff, valid.max_backoff, 1.6, 1.0).is_err());
    }
}
