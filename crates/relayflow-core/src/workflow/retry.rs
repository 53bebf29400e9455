//! Retry policy for failed stage actions.

use relayflow_types::event::StageEvent;

/// What to do with a stage whose action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Never commit a failed message; the broker redelivers it until the
    /// action succeeds. Blocks the partition while the failure persists.
    Redeliver,
    /// Re-queue the stage with an incremented attempt counter, and
    /// dead-letter it once `max_attempts` attempts have failed.
    Bounded { max_attempts: u32 },
}

/// The decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the offset uncommitted.
    Redeliver,
    /// Publish this event and commit.
    Requeue(StageEvent),
    /// Publish a dead letter and commit.
    DeadLetter,
}

impl RetryPolicy {
    /// `0` means redeliver forever.
    pub fn from_max_attempts(max_attempts: u32) -> Self {
        if max_attempts == 0 {
            Self::Redeliver
        } else {
            Self::Bounded { max_attempts }
        }
    }

    /// Decide what to do after `event` failed with a retryable error.
    pub fn decide(&self, event: &StageEvent) -> RetryDecision {
        match *self {
            Self::Redeliver => RetryDecision::Redeliver,
            Self::Bounded { max_attempts } => {
                if event.attempt.saturating_add(1) >= max_attempts {
                    RetryDecision::DeadLetter
                } else {
                    RetryDecision::Requeue(event.retry())
                }
            }
        }
    }

    /// Decide what to do after `event` failed with an error retrying cannot fix.
    pub fn decide_permanent(&self) -> RetryDecision {
        match self {
            Self::Redeliver => RetryDecision::Redeliver,
            Self::Bounded { .. } => RetryDecision::DeadLetter,
        }
    }
}
