//! Bounded reconnection policy for the session socket.

use std::time::Duration;

/// Default delay before a reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default cap on consecutive reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// What to do when a scheduled retry comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A socket is already open, or reconnecting is no longer wanted.
    Skip,
    /// The attempt cap was exceeded. Nothing further is scheduled.
    GiveUp,
    /// Reconnect now; `attempt` counts from 1.
    Retry { attempt: u32 },
}

/// Counts consecutive reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
}

impl ReconnectSupervisor {
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            delay,
        }
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a closed socket should schedule a retry at all.
    ///
    /// Without a device there is nothing to resynchronise, and an auth error
    /// waits for the user.
    #[must_use]
    pub const fn should_schedule(device_selected: bool, auth_error: bool, has_address: bool) -> bool {
        device_selected && !auth_error && has_address
    }

    /// Decide a retry that came due.
    pub fn on_retry_due(&mut self, socket_open: bool, auth_error: bool) -> RetryDecision {
        if socket_open || auth_error {
            return RetryDecision::Skip;
        }
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            attempt: self.attempts,
        }
    }

    /// A slot authenticated; start counting again.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut supervisor = ReconnectSupervisor::default();
        for attempt in 1..=10 {
            assert_eq!(
                supervisor.on_retry_due(false, false),
                RetryDecision::Retry { attempt }
            );
        }
        assert_eq!(supervisor.on_retry_due(false, false), RetryDecision::GiveUp);

        supervisor.reset();
        assert_eq!(
            supervisor.on_retry_due(false, false),
            RetryDecision::Retry { attempt: 1 }
        );
    }

    #[test]
    fn test_skip_does_not_count() {
        let mut supervisor = ReconnectSupervisor::default();
        assert_eq!(supervisor.on_retry_due(true, false), RetryDecision::Skip);
        assert_eq!(supervisor.on_retry_due(false, true), RetryDecision::Skip);
        assert_eq!(supervisor.attempts(), 0);
    }

    #[test]
    fn test_should_schedule() {
        assert!(ReconnectSupervisor::should_schedule(true, false, true));
        assert!(!ReconnectSupervisor::should_schedule(false, false, true));
        assert!(!ReconnectSupervisor::should_schedule(true, true, true));
        assert!(!ReconnectSupervisor::should_schedule(true, false, false));
    }
}
