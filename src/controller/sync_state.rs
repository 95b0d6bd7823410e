//! Outcome of a single reconciliation and the scheduling decision it implies

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing left to do until the object changes
    Success,
    /// Try again after the fixed retry delay
    RetryableError,
    /// Needs an operator edit; never retried on its own
    TerminalError,
}

impl SyncState {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => SyncState::Success,
            Err(e) => Self::from_error(e),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        if error.is_retriable() {
            SyncState::RetryableError
        } else {
            SyncState::TerminalError
        }
    }

    pub fn action(self, retry_delay: Duration) -> Action {
        match self {
            SyncState::RetryableError => Action::requeue(retry_delay),
            SyncState::Success | SyncState::TerminalError => Action::await_change(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_awaits_change() {
        let result: Result<()> = Ok(());
        assert_eq!(SyncState::of(&result), SyncState::Success);
        assert_eq!(
            SyncState::Success.action(Duration::from_secs(3)),
            Action::await_change()
        );
    }

    #[test]
    fn test_retryable_requeues_after_delay() {
        let result: Result<()> = Err(Error::TransientInfraError("pod not running".into()));
        let state = SyncState::of(&result);
        assert_eq!(state, SyncState::RetryableError);
        assert_eq!(
            state.action(Duration::from_secs(3)),
            Action::requeue(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_terminal_is_not_requeued() {
        let result: Result<()> = Err(Error::CapacityExhausted("subnet ovn-default".into()));
        let state = SyncState::of(&result);
        assert_eq!(state, SyncState::TerminalError);
        assert_eq!(state.action(Duration::from_secs(3)), Action::await_change());
    }
}
