use std::time::Duration;

use crate::transport::TransportError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts for network-class failures, including the first.
    pub max_attempts: u32,
    /// The wait before attempt n+1 is `n * backoff_unit`.
    pub backoff_unit: Duration,
    pub max_conflict_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            max_conflict_retries: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    Validation,
    ConflictsExhausted,
    AttemptsExhausted,
    NonRetryable,
}

/// State of one batch commit.
///
/// `attempt` counts network attempts and starts at 1; conflict retries are
/// counted separately and do not consume network attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitState {
    Attempting { attempt: u32, conflicts: u32 },
    /// The server saw a stale concurrency guard. Refetch, then retry the same batch.
    Conflict { attempt: u32, conflicts: u32 },
    BackoffWait { attempt: u32, conflicts: u32, delay: Duration },
    Succeeded,
    Failed { attempt: u32, reason: FailReason },
}

impl CommitState {
    pub fn start() -> Self {
        Self::Attempting { attempt: 1, conflicts: 0 }
    }

    pub fn on_success(&self) -> Self {
        Self::Succeeded
    }

    /// Transition out of `Attempting` after a failed commit.
    pub fn on_error(&self, error: &TransportError, policy: &RetryPolicy) -> Self {
        let (attempt, conflicts) = match *self {
            Self::Attempting { attempt, conflicts } => (attempt, conflicts),
            ref other => return other.clone(),
        };

        match error {
            TransportError::Validation(_) => Self::Failed {
                attempt,
                reason: FailReason::Validation,
            },
            e if e.is_conflict() => {
                if conflicts >= policy.max_conflict_retries {
                    Self::Failed {
                        attempt,
                        reason: FailReason::ConflictsExhausted,
                    }
                } else {
                    Self::Conflict {
                        attempt,
                        conflicts: conflicts + 1,
                    }
                }
            }
            e if e.is_network_class() => {
                if attempt >= policy.max_attempts {
                    Self::Failed {
                        attempt,
                        reason: FailReason::AttemptsExhausted,
                    }
                } else {
                    Self::BackoffWait {
                        attempt,
                        conflicts,
                        delay: policy.backoff_unit * attempt,
                    }
                }
            }
            _ => Self::Failed {
                attempt,
                reason: FailReason::NonRetryable,
            },
        }
    }

    /// Leave `Conflict` (after the refetch) or `BackoffWait` (after sleeping).
    pub fn resume(&self) -> Self {
        match *self {
            Self::Conflict { attempt, conflicts } => Self::Attempting { attempt, conflicts },
            Self::BackoffWait { attempt, conflicts, .. } => Self::Attempting {
                attempt: attempt + 1,
                conflicts,
            },
            ref other => other.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    fn network() -> TransportError {
        TransportError::Network("connection refused".into())
    }

    #[test]
    fn success_is_terminal() {
        let s = CommitState::start().on_success();
        assert_eq!(s, CommitState::Succeeded);
        assert!(s.is_terminal());
    }

    #[test]
    fn validation_fails_immediately() {
        let s = CommitState::start().on_error(&TransportError::Validation(vec!["x".into()]), &policy());
        assert_eq!(
            s,
            CommitState::Failed {
                attempt: 1,
                reason: FailReason::Validation
            }
        );
    }

    #[test]
    fn network_errors_back_off_linearly_until_exhausted() {
        let p = policy();
        let s = CommitState::start().on_error(&network(), &p);
        assert_eq!(
            s,
            CommitState::BackoffWait {
                attempt: 1,
                conflicts: 0,
                delay: Duration::from_secs(1)
            }
        );

        let s = s.resume().on_error(&network(), &p);
        assert_eq!(
            s,
            CommitState::BackoffWait {
                attempt: 2,
                conflicts: 0,
                delay: Duration::from_secs(2)
            }
        );

        let s = s.resume().on_error(&TransportError::Timeout("slow".into()), &p);
        assert_eq!(
            s,
            CommitState::Failed {
                attempt: 3,
                reason: FailReason::AttemptsExhausted
            }
        );
    }

    #[test]
    fn conflicts_do_not_consume_attempts() {
        let p = policy();
        let conflict = TransportError::Conflict("stale".into());
        let mut s = CommitState::start();
        for n in 1..=3 {
            s = s.on_error(&conflict, &p);
            assert_eq!(s, CommitState::Conflict { attempt: 1, conflicts: n });
            s = s.resume();
            assert_eq!(s, CommitState::Attempting { attempt: 1, conflicts: n });
        }
        assert_eq!(
            s.on_error(&conflict, &p),
            CommitState::Failed {
                attempt: 1,
                reason: FailReason::ConflictsExhausted
            }
        );
    }

    #[test]
    fn other_errors_are_not_retried() {
        let s = CommitState::start().on_error(
            &TransportError::Rejected {
                status: 500,
                body: "boom".into(),
            },
            &policy(),
        );
        assert_eq!(
            s,
            CommitState::Failed {
                attempt: 1,
                reason: FailReason::NonRetryable
            }
        );
    }

    #[test]
    fn terminal_states_absorb_events() {
        let failed = CommitState::Failed {
            attempt: 2,
            reason: FailReason::NonRetryable,
        };
        assert_eq!(failed.on_error(&network(), &policy()), failed);
        assert_eq!(failed.resume(), failed);
    }
}
