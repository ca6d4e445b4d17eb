//! Fixed-interval polling with an optional attempt bound and cooperative
//! cancellation.
//!
//! Every waiting loop in the workflow (boot readiness, SSH reachability,
//! allocating a specific floating address) retries forever by default. A
//! [`PollPolicy`] may cap the number of attempts, and the caller's
//! [`CancellationToken`] aborts a loop between attempts.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Interval and optional attempt bound for a polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between two consecutive attempts.
    pub interval: Duration,
    /// Maximum number of attempts; `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    /// Unbounded policy sleeping `interval` between attempts.
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Caps the loop at `max_attempts` attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Reason a polling loop stopped without reaching its goal.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum PollStop {
    /// The cancellation token fired.
    #[error("cancelled by the operator")]
    Cancelled,
    /// The configured attempt bound was reached.
    #[error("gave up after {0} attempts")]
    AttemptsExhausted(u32),
}

/// Tracks attempts of a single polling loop.
#[derive(Clone, Debug)]
pub struct Poller {
    policy: PollPolicy,
    cancel: CancellationToken,
    attempts: u32,
}

impl Poller {
    /// Starts a loop governed by `policy` and aborted by `cancel`.
    #[must_use]
    pub const fn new(policy: PollPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            attempts: 0,
        }
    }

    /// Number of failed attempts recorded so far, which is also the number
    /// of sleeps performed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a failed attempt and sleeps before the next one.
    ///
    /// # Errors
    ///
    /// Returns [`PollStop::AttemptsExhausted`] once the bound is hit and
    /// [`PollStop::Cancelled`] when the token fires first.
    pub async fn pause(&mut self) -> Result<(), PollStop> {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max) = self.policy.max_attempts
            && self.attempts >= max
        {
            return Err(PollStop::AttemptsExhausted(self.attempts));
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(PollStop::Cancelled),
            () = sleep(self.policy.interval) => Ok(()),
        }
    }
}
