//! Reconnect attempt counter.
//!
//! Each failed open or unrequested close is one attempt. Attempts below
//! `max_attempts` schedule a retry; reaching it yields
//! [`BackoffStep::Exhausted`] once, after which the counter stays silent until
//! [`ReconnectBackoff::reset`].

use std::time::Duration;

use iterlink_core::retry::BackoffConfig;

/// What to do after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStep {
    /// Try again after `delay`.
    Retry {
        /// 1-based failure count.
        attempt: u32,
        /// Jittered delay.
        delay: Duration,
    },
    /// Attempts used up; report it.
    Exhausted {
        /// Failures counted.
        attempts: u32,
    },
    /// Attempts used up and already reported.
    Silent,
}

/// Backoff state owned by the connection actor.
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    attempts: u32,
    reported: bool,
}

impl ReconnectBackoff {
    /// Fresh counter.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            reported: false,
        }
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure. `random` is in `[0.0, 1.0)` and drives jitter.
    pub fn on_failure(&mut self, random: f64) -> BackoffStep {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.config.max_attempts {
            if self.reported {
                return BackoffStep::Silent;
            }
            self.reported = true;
            return BackoffStep::Exhausted {
                attempts: self.attempts,
            };
        }
        BackoffStep::Retry {
            attempt: self.attempts,
            delay: self.config.delay_for(self.attempts - 1, random),
        }
    }

    /// Back to the initial delay; re-arms the exhausted report.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.reported = false;
    }
}
