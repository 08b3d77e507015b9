//! Retry/backoff policy for the client call state machine (spec §4.6
//! "Retry policy").
//!
//! Grounded in the teacher's `RetryConfig`/`RetryExecutor` exponential
//! backoff shape, narrowed from a generic retryable/non-retryable bool
//! to the spec's three-way action classification. At-most-once gating
//! (retry forbidden once `Start` has been invoked on a Flow) is call
//! state, not policy, and is enforced by the caller in `client.rs`.

use std::time::Duration;

use crate::error::CoreError;

/// What a call should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-resolve the name before dialing again.
    RetryRefetch,
    /// Dial again using the already-resolved server list.
    RetryConnection,
    /// Surface the error immediately.
    NoRetry,
}

/// Classifies an error from Resolve or ParallelDial into the action a
/// retrying caller should take (spec §4.6 step 1 and "Retry vs fatal").
pub fn classify_action(error: &CoreError) -> RetryAction {
    match error {
        CoreError::NoExist(_) => RetryAction::RetryRefetch,
        CoreError::NoServers(_) => RetryAction::RetryRefetch,
        CoreError::Io(_) => RetryAction::RetryConnection,
        CoreError::NotTrusted(_) => RetryAction::NoRetry,
        CoreError::Timeout(_) => RetryAction::NoRetry,
        CoreError::Canceled(_) => RetryAction::NoRetry,
        _ => RetryAction::NoRetry,
    }
}

/// Exponential backoff schedule: starts at `initial`, doubles each
/// attempt, caps at `max`. Jitter-free; the schedule's own deadline
/// check (via [`BackoffSchedule::next`]) is what stops retrying when
/// the remaining deadline is shorter than the next delay.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
    }
}

impl BackoffSchedule {
    /// Builds a schedule starting at `initial`, doubling (or by
    /// `multiplier`) each call to `next`, capped at `max`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        BackoffSchedule {
            initial,
            max,
            multiplier,
            attempt: 0,
        }
    }

    /// The delay before the next attempt, or `None` if `remaining`
    /// (time left on the call's deadline) is shorter than that delay —
    /// in which case the caller must stop retrying and surface the
    /// last error.
    pub fn next(&mut self, remaining: Duration) -> Option<Duration> {
        let base_ms = self.initial.as_millis() as f64;
        let computed = base_ms * self.multiplier.powi(self.attempt as i32);
        let capped = Duration::from_millis(computed.min(self.max.as_millis() as f64) as u64);
        self.attempt += 1;
        if capped > remaining {
            None
        } else {
            Some(capped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_resolve_errors() {
        assert_eq!(
            classify_action(&CoreError::NoExist("x".into())),
            RetryAction::RetryRefetch
        );
        assert_eq!(
            classify_action(&CoreError::NoServers("x".into())),
            RetryAction::RetryRefetch
        );
    }

    #[test]
    fn classify_network_error_reuses_resolution() {
        let io = CoreError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "x"));
        assert_eq!(classify_action(&io), RetryAction::RetryConnection);
    }

    #[test]
    fn classify_trust_timeout_cancel_are_fatal() {
        assert_eq!(
            classify_action(&CoreError::NotTrusted("x".into())),
            RetryAction::NoRetry
        );
        assert_eq!(
            classify_action(&CoreError::Timeout(Duration::from_secs(1))),
            RetryAction::NoRetry
        );
        assert_eq!(
            classify_action(&CoreError::Canceled("x".into())),
            RetryAction::NoRetry
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut sched = BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(10), 2.0);
        assert_eq!(sched.next(Duration::from_secs(10)), Some(Duration::from_millis(100)));
        assert_eq!(sched.next(Duration::from_secs(10)), Some(Duration::from_millis(200)));
        assert_eq!(sched.next(Duration::from_secs(10)), Some(Duration::from_millis(400)));
    }

    #[test]
    fn backoff_stops_when_deadline_too_short() {
        let mut sched = BackoffSchedule::new(Duration::from_millis(100), Duration::from_secs(10), 2.0);
        assert_eq!(sched.next(Duration::from_millis(50)), None);
    }
}
