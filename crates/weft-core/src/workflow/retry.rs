//! Retry policy for `validate` steps.
//!
//! A validate step runs its stages in order. When a stage fails and retry
//! budget remains, the optional `on_failure` step runs as a corrective action
//! and the stages are attempted again from the top. `retry` counts
//! re-attempts, so a step with `retry: 3` runs its stages at most 4 times.

// ---------------------------------------------------------------------------
// RetryAction
// ---------------------------------------------------------------------------

/// What to do after a failed validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Run the corrective step, then re-attempt.
    Correct,
    /// Re-attempt without a corrective step.
    Rerun,
    /// Budget spent; fail with `RetryExhausted`.
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry policy. All inputs are passed per call.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(retry: u32, attempt: u32) -> bool {
        attempt <= retry
    }

    /// Decide the follow-up to a failed attempt.
    pub fn next_action(retry: u32, attempt: u32, has_corrective: bool) -> RetryAction {
        if !Self::should_retry(retry, attempt) {
            RetryAction::GiveUp
        } else if has_corrective {
            RetryAction::Correct
        } else {
            RetryAction::Rerun
        }
    }

    /// Failure text handed to the corrective step and carried by
    /// `RetryExhausted`.
    pub fn describe_failure(stage: &str, error: &str) -> String {
        format!("stage '{stage}' failed: {error}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_counts_reattempts() {
        // retry: 0 means a single attempt.
        assert!(!RetryHandler::should_retry(0, 1));

        assert!(RetryHandler::should_retry(3, 1));
        assert!(RetryHandler::should_retry(3, 3));
        assert!(!RetryHandler::should_retry(3, 4));
    }

    #[test]
    fn test_next_action() {
        assert_eq!(RetryHandler::next_action(2, 1, true), RetryAction::Correct);
        assert_eq!(RetryHandler::next_action(2, 1, false), RetryAction::Rerun);
        assert_eq!(RetryHandler::next_action(2, 3, true), RetryAction::GiveUp);
    }

    #[test]
    fn test_describe_failure() {
        assert_eq!(
            RetryHandler::describe_failure("lint", "3 warnings"),
            "stage 'lint' failed: 3 warnings"
        );
    }
}
