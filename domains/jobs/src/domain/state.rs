//! Job state machine
//!
//! Every persisted status change goes through a compare-and-set against the
//! expected current status; this module defines which transitions are legal
//! in the first place. Terminal states transition nowhere.

use thiserror::Error;

/// Errors that can occur during state transitions
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("Invalid transition: cannot transition from {from} to {to} via {event}")]
    InvalidTransition {
        from: String,
        to: String,
        event: String,
    },

    #[error("Terminal state: {0} is a terminal state and cannot transition")]
    TerminalState(String),
}

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Get all valid next states from current state
    pub fn valid_transitions(&self) -> &'static [JobState] {
        match self {
            Self::Pending => &[Self::Queued, Self::Cancelled],
            Self::Queued => &[Self::Running, Self::Pending, Self::Cancelled],
            Self::Running => &[Self::Succeeded, Self::Failed, Self::Cancelled, Self::Queued],
            Self::Succeeded => &[],
            Self::Failed => &[],
            Self::Cancelled => &[],
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Events that trigger job state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Admission or the supervisor places the job in the broker
    Enqueue,
    /// Broker admission failed after commit; park until the supervisor drains
    Degrade,
    /// A worker acquires the lease and starts executing
    Lease,
    /// Render finished and the artifact is persisted
    Succeed,
    /// Terminal failure
    Fail,
    /// Cancelled by user or operator
    Cancel,
    /// Transient failure or lost worker; back to the queue for another attempt
    Requeue,
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enqueue => write!(f, "enqueue"),
            Self::Degrade => write!(f, "degrade"),
            Self::Lease => write!(f, "lease"),
            Self::Succeed => write!(f, "succeed"),
            Self::Fail => write!(f, "fail"),
            Self::Cancel => write!(f, "cancel"),
            Self::Requeue => write!(f, "requeue"),
        }
    }
}

/// Job state machine
pub struct JobStateMachine;

impl JobStateMachine {
    /// Attempt a state transition
    ///
    /// Returns the new state if the transition is valid, or an error otherwise.
    pub fn transition(current: JobState, event: JobEvent) -> Result<JobState, StateError> {
        // Check for terminal state
        if current.is_terminal() {
            return Err(StateError::TerminalState(current.to_string()));
        }

        let next = match (&current, &event) {
            // From Pending
            (JobState::Pending, JobEvent::Enqueue) => JobState::Queued,
            (JobState::Pending, JobEvent::Cancel) => JobState::Cancelled,

            // From Queued
            (JobState::Queued, JobEvent::Lease) => JobState::Running,
            (JobState::Queued, JobEvent::Degrade) => JobState::Pending,
            (JobState::Queued, JobEvent::Cancel) => JobState::Cancelled,

            // From Running
            (JobState::Running, JobEvent::Succeed) => JobState::Succeeded,
            (JobState::Running, JobEvent::Fail) => JobState::Failed,
            (JobState::Running, JobEvent::Cancel) => JobState::Cancelled,
            (JobState::Running, JobEvent::Requeue) => JobState::Queued,

            // Invalid transitions
            _ => {
                return Err(StateError::InvalidTransition {
                    from: current.to_string(),
                    to: "unknown".to_string(),
                    event: event.to_string(),
                });
            }
        };

        Ok(next)
    }

    /// Check if a transition is valid without performing it
    pub fn can_transition(current: JobState, event: &JobEvent) -> bool {
        Self::transition(current, event.clone()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pending_to_queued() {
        let result = JobStateMachine::transition(JobState::Pending, JobEvent::Enqueue);
        assert_eq!(result, Ok(JobState::Queued));
    }

    #[test]
    fn test_valid_queued_to_running() {
        let result = JobStateMachine::transition(JobState::Queued, JobEvent::Lease);
        assert_eq!(result, Ok(JobState::Running));
    }

    #[test]
    fn test_valid_queued_back_to_pending() {
        let result = JobStateMachine::transition(JobState::Queued, JobEvent::Degrade);
        assert_eq!(result, Ok(JobState::Pending));
    }

    #[test]
    fn test_valid_running_outcomes() {
        assert_eq!(
            JobStateMachine::transition(JobState::Running, JobEvent::Succeed),
            Ok(JobState::Succeeded)
        );
        assert_eq!(
            JobStateMachine::transition(JobState::Running, JobEvent::Fail),
            Ok(JobState::Failed)
        );
        assert_eq!(
            JobStateMachine::transition(JobState::Running, JobEvent::Cancel),
            Ok(JobState::Cancelled)
        );
        assert_eq!(
            JobStateMachine::transition(JobState::Running, JobEvent::Requeue),
            Ok(JobState::Queued)
        );
    }

    #[test]
    fn test_cancel_from_every_live_state() {
        for state in [JobState::Pending, JobState::Queued, JobState::Running] {
            assert_eq!(
                JobStateMachine::transition(state, JobEvent::Cancel),
                Ok(JobState::Cancelled)
            );
        }
    }

    #[test]
    fn test_invalid_queued_to_succeeded() {
        let result = JobStateMachine::transition(JobState::Queued, JobEvent::Succeed);
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
    }

    #[test]
    fn test_invalid_pending_to_running() {
        let result = JobStateMachine::transition(JobState::Pending, JobEvent::Lease);
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
    }

    #[test]
    fn test_terminal_states_cannot_transition() {
        for state in [JobState::Succeeded, JobState::Failed, JobState::Cancelled] {
            for event in [
                JobEvent::Enqueue,
                JobEvent::Lease,
                JobEvent::Succeed,
                JobEvent::Fail,
                JobEvent::Cancel,
                JobEvent::Requeue,
            ] {
                let result = JobStateMachine::transition(state, event);
                assert!(matches!(result, Err(StateError::TerminalState(_))));
            }
        }
    }

    #[test]
    fn test_is_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_valid_transitions_from_running() {
        let transitions = JobState::Running.valid_transitions();
        assert!(transitions.contains(&JobState::Succeeded));
        assert!(transitions.contains(&JobState::Failed));
        assert!(transitions.contains(&JobState::Cancelled));
        assert!(transitions.contains(&JobState::Queued));
        assert_eq!(transitions.len(), 4);
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        assert!(JobState::Succeeded.valid_transitions().is_empty());
        assert!(JobState::Failed.valid_transitions().is_empty());
        assert!(JobState::Cancelled.valid_transitions().is_empty());
    }

    #[test]
    fn test_can_transition() {
        assert!(JobStateMachine::can_transition(
            JobState::Queued,
            &JobEvent::Lease
        ));
        assert!(!JobStateMachine::can_transition(
            JobState::Queued,
            &JobEvent::Succeed
        ));
        assert!(!JobStateMachine::can_transition(
            JobState::Succeeded,
            &JobEvent::Cancel
        ));
    }
}
