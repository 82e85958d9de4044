// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic poll-until-condition-or-timeout combinator.
//!
//! Every waiter in the update engine (DNS membership, instance health, shard
//! role readiness, ensemble membership) is expressed as a (predicate,
//! interval, attempt budget) triple on top of [`poll_until`].  None of them
//! carry their own retry loop.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Default interval between condition checks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default attempt budget (5 minutes at [`POLL_INTERVAL`]).
pub const POLL_MAX_ATTEMPTS: usize = 60;

/// Attempt budget for shard topology waits, which can legitimately take much
/// longer than service health checks (15 minutes at [`POLL_INTERVAL`]).
pub const SHARD_POLL_MAX_ATTEMPTS: usize = 180;

/// Result of a single condition check inside [`poll_until`].
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; check again after the interval.
    NotYet,
    /// The condition can never hold.  Stop immediately and propagate.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(e: E) -> Self {
        CondCheckError::Failed(e)
    }
}

/// A waiter exhausted its attempt budget without observing its condition.
#[derive(Debug, thiserror::Error)]
#[error(
    "timed out after {attempts} attempts ({elapsed:?}) waiting for \
     {condition}"
)]
pub struct TimeoutError {
    pub condition: String,
    pub attempts: usize,
    pub elapsed: Duration,
}

/// Terminal outcome of [`poll_until`] when the condition was never observed.
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("condition check failed permanently")]
    Fatal(#[source] E),
}

/// Invokes `check` every `interval` until it reports the condition holds, it
/// reports a fatal error, or `max_attempts` checks have been made.
///
/// The first check happens immediately, so a condition that already holds is
/// observed without any delay.  `condition` is a human-readable description
/// of what is being awaited; it is embedded in the [`TimeoutError`] so the
/// operator can tell which phase stalled.
pub async fn poll_until<T, E, Func, Fut>(
    condition: &str,
    interval: Duration,
    max_attempts: usize,
    mut check: Func,
) -> Result<T, PollError<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CondCheckError<E>>>,
{
    let start = Instant::now();
    for _ in 0..max_attempts {
        match check().await {
            Ok(value) => return Ok(value),
            Err(CondCheckError::NotYet) => (),
            Err(CondCheckError::Failed(e)) => {
                return Err(PollError::Fatal(e));
            }
        }
        tokio::time::sleep(interval).await;
    }
    Err(PollError::Timeout(TimeoutError {
        condition: condition.to_string(),
        attempts: max_attempts,
        elapsed: start.elapsed(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn already_satisfied_condition_returns_immediately() {
        let start = Instant::now();
        let result = poll_until::<_, Infallible, _, _>(
            "nothing at all",
            POLL_INTERVAL,
            POLL_MAX_ATTEMPTS,
            || async { Ok(7) },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_exactly_the_attempt_budget() {
        let attempts = AtomicUsize::new(0);
        let start = Instant::now();
        let result = poll_until::<(), Infallible, _, _>(
            "a condition that never holds",
            POLL_INTERVAL,
            POLL_MAX_ATTEMPTS,
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CondCheckError::NotYet)
            },
        )
        .await;
        let err = match result {
            Err(PollError::Timeout(err)) => err,
            other => panic!("expected timeout, got {other:?}"),
        };
        assert_eq!(attempts.load(Ordering::SeqCst), 60);
        assert_eq!(err.attempts, 60);
        assert_eq!(err.condition, "a condition that never holds");
        // 60 attempts at a 5 second interval is 5 minutes on the paused
        // clock.
        assert_eq!(start.elapsed(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_check_short_circuits() {
        let attempts = AtomicUsize::new(0);
        let result = poll_until::<(), &str, _, _>(
            "a condition that fails fast",
            POLL_INTERVAL,
            POLL_MAX_ATTEMPTS,
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n >= 2 {
                    Err(CondCheckError::Failed("unrecoverable"))
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
        )
        .await;
        match result {
            Err(PollError::Fatal("unrecoverable")) => (),
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_midway_through_the_budget() {
        let attempts = AtomicUsize::new(0);
        let start = Instant::now();
        let result = poll_until::<_, Infallible, _, _>(
            "three polls of patience",
            POLL_INTERVAL,
            POLL_MAX_ATTEMPTS,
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 3 {
                    Ok("done")
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }
}
