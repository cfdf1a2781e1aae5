//! Bounded retry loop shared by SSH readiness checks, vendor operation
//! polling, and deletion retries.
//!
//! A [`RetryPolicy`] groups attempts into rounds. Attempts within a round
//! are spaced by `interval`; rounds are separated by `round_backoff`. When a
//! round deadline is enabled each round also stops once `attempts ×
//! interval` has elapsed since it started. The prober never sleeps after
//! the final attempt of a round.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{info, warn};

/// Pause between SSH probing rounds.
pub const SSH_ROUND_BACKOFF: Duration = Duration::from_secs(30);

/// Number of SSH probing rounds.
pub const SSH_ROUNDS: u32 = 3;

/// Attempts made when deleting a resource.
pub const DELETE_ATTEMPTS: u32 = 3;

/// Pause between deletion attempts.
pub const DELETE_INTERVAL: Duration = Duration::from_secs(30);

/// Spacing of vendor operation polls.
pub const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single vendor operation.
pub const OPERATION_MAX_WAIT: Duration = Duration::from_secs(30 * 60);

/// Shape of a retry loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Number of rounds.
    pub rounds: u32,
    /// Attempts per round.
    pub attempts: u32,
    /// Pause between attempts inside a round.
    pub interval: Duration,
    /// Pause between rounds.
    pub round_backoff: Duration,
    /// Whether each round is cut off after `attempts × interval`. Such
    /// rounds also pause after their last failed attempt.
    pub round_deadline: bool,
}

impl RetryPolicy {
    /// SSH readiness: three rounds of `connect_retries` probes.
    #[must_use]
    pub const fn ssh(connect_retries: u32, connect_interval: Duration) -> Self {
        Self {
            rounds: SSH_ROUNDS,
            attempts: connect_retries,
            interval: connect_interval,
            round_backoff: SSH_ROUND_BACKOFF,
            round_deadline: true,
        }
    }

    /// Resource deletion: three attempts thirty seconds apart.
    #[must_use]
    pub const fn deletion() -> Self {
        Self {
            rounds: 1,
            attempts: DELETE_ATTEMPTS,
            interval: DELETE_INTERVAL,
            round_backoff: Duration::ZERO,
            round_deadline: false,
        }
    }

    /// Vendor operation polling at `interval` for at most `max_wait`.
    #[must_use]
    pub fn operation(interval: Duration, max_wait: Duration) -> Self {
        let polls = max_wait
            .as_millis()
            .checked_div(interval.as_millis())
            .unwrap_or(1)
            .max(1);
        Self {
            rounds: 1,
            attempts: u32::try_from(polls).unwrap_or(u32::MAX),
            interval,
            round_backoff: Duration::ZERO,
            round_deadline: false,
        }
    }

    /// Upper bound on the number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.rounds.saturating_mul(self.attempts)
    }
}

/// Result of a single probe attempt.
#[derive(Debug)]
pub enum ProbeStep<T, E> {
    /// The awaited condition holds.
    Ready(T),
    /// Not yet; try again if the policy allows.
    Retry(E),
    /// Stop immediately; retrying cannot help.
    Abort(E),
}

/// Final result of a probing loop.
#[derive(Debug)]
pub enum ProbeOutcome<T, E> {
    /// A probe succeeded.
    Ready {
        /// Value produced by the successful probe.
        value: T,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// The policy ran out of attempts.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Reason reported by the last attempt.
        last: Option<E>,
    },
    /// A probe asked to stop.
    Aborted {
        /// Attempts made.
        attempts: u32,
        /// Reason reported by the aborting attempt.
        error: E,
    },
}

impl<T, E> ProbeOutcome<T, E> {
    /// Attempts made before the loop ended.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Ready { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Aborted { attempts, .. } => *attempts,
        }
    }
}

/// Runs probes according to a [`RetryPolicy`].
#[derive(Clone, Copy, Debug)]
pub struct Prober {
    policy: RetryPolicy,
    label: &'static str,
}

impl Prober {
    /// Creates a prober; `label` names the awaited condition in logs.
    #[must_use]
    pub const fn new(policy: RetryPolicy, label: &'static str) -> Self {
        Self { policy, label }
    }

    /// Policy driving this prober.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Calls `probe` with the 1-based attempt number until it is ready,
    /// aborts, or the policy is exhausted.
    pub async fn run<T, E, F, Fut>(&self, mut probe: F) -> ProbeOutcome<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProbeStep<T, E>>,
    {
        let policy = self.policy;
        let mut attempts = 0_u32;
        let mut last = None;

        for round in 1..=policy.rounds {
            let deadline = policy
                .round_deadline
                .then(|| Instant::now() + policy.interval.saturating_mul(policy.attempts));
            let mut in_round = 0_u32;

            while in_round < policy.attempts
                && deadline.is_none_or(|limit| Instant::now() < limit)
            {
                attempts += 1;
                in_round += 1;
                match probe(attempts).await {
                    ProbeStep::Ready(value) => return ProbeOutcome::Ready { value, attempts },
                    ProbeStep::Abort(error) => {
                        warn!(label = self.label, attempt = attempts, error = %error, "giving up");
                        return ProbeOutcome::Aborted { attempts, error };
                    }
                    ProbeStep::Retry(reason) => last = Some(reason),
                }
                // Deadline rounds pause after every failure, the last one included.
                if policy.round_deadline || in_round < policy.attempts {
                    sleep(policy.interval).await;
                }
            }

            if round < policy.rounds {
                info!(
                    label = self.label,
                    round,
                    backoff_secs = policy.round_backoff.as_secs(),
                    "{} not ready, retrying after {} seconds",
                    self.label,
                    policy.round_backoff.as_secs()
                );
                sleep(policy.round_backoff).await;
            }
        }

        ProbeOutcome::Exhausted { attempts, last }
    }
}
