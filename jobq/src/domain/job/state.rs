//! Job lifecycle state machine.

use serde::{Deserialize, Serialize};

use super::JobId;
use crate::{Error, Result};

/// Job lifecycle states.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created but awaiting confirmation before it may run.
    #[default]
    New,
    /// Eligible to be picked up by a worker.
    Pending,
    /// Canceled before it ran.
    Canceled,
    /// Currently executing on the worker that holds its lock.
    Running,
    /// Finished successfully.
    Finished,
    /// Ran and failed.
    Failed,
    /// Killed by the runner (e.g. exceeded its max runtime).
    Terminated,
    /// Ran but did not complete (e.g. the worker went away).
    Incomplete,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        Self::New,
        Self::Pending,
        Self::Canceled,
        Self::Running,
        Self::Finished,
        Self::Failed,
        Self::Terminated,
        Self::Incomplete,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Canceled => "canceled",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Incomplete => "incomplete",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "pending" => Some(Self::Pending),
            "canceled" => Some(Self::Canceled),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            "terminated" => Some(Self::Terminated),
            "incomplete" => Some(Self::Incomplete),
            _ => None,
        }
    }

    /// No outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Finished | Self::Failed | Self::Terminated | Self::Incomplete
        )
    }

    /// A terminal state a RUNNING job can end in.
    pub fn is_run_outcome(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Terminated | Self::Incomplete
        )
    }

    /// Closed, but not successfully.
    pub fn is_closed_non_successful(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Failed | Self::Terminated | Self::Incomplete
        )
    }

    /// States reachable from this one in a single transition.
    pub fn allowed_transitions(&self) -> &'static [JobState] {
        use JobState::*;

        match self {
            New => &[Pending, Canceled],
            Pending => &[Running, Canceled],
            Running => &[Finished, Failed, Terminated, Incomplete],
            Canceled | Finished | Failed | Terminated | Incomplete => &[],
        }
    }

    /// Validate a state transition. Staying in the same state is always allowed.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        *self == target || self.allowed_transitions().contains(&target)
    }

    /// Attempt to transition `job_id` to a new state.
    pub fn transition_to(&self, job_id: JobId, target: JobState) -> Result<JobState> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                job_id,
                from: *self,
                to: target,
                allowed: self.allowed_transitions().to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_from_str() {
        assert_eq!(JobState::parse("running"), Some(JobState::Running));
        assert_eq!(JobState::parse("incomplete"), Some(JobState::Incomplete));
        assert_eq!(JobState::parse("RUNNING"), None);
        assert_eq!(JobState::from_str("canceled").ok(), Some(JobState::Canceled));
    }

    #[test]
    fn test_display_matches_db_representation() {
        for state in JobState::ALL {
            assert_eq!(state.to_string(), state.as_str());
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Finished.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(JobState::Incomplete.is_terminal());
        assert!(!JobState::New.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(JobState::New.can_transition_to(JobState::Pending));
        assert!(JobState::New.can_transition_to(JobState::Canceled));
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Pending.can_transition_to(JobState::Canceled));
        for outcome in [
            JobState::Finished,
            JobState::Failed,
            JobState::Terminated,
            JobState::Incomplete,
        ] {
            assert!(JobState::Running.can_transition_to(outcome));
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!JobState::Finished.can_transition_to(JobState::Running));
        assert!(!JobState::New.can_transition_to(JobState::Running));
        assert!(!JobState::Running.can_transition_to(JobState::Canceled));
        assert!(!JobState::Canceled.can_transition_to(JobState::Pending));
        assert!(!JobState::Pending.can_transition_to(JobState::Finished));
    }

    #[test]
    fn test_transition_to_reports_allowed_states() {
        assert_eq!(
            JobState::Pending
                .transition_to(JobId(1), JobState::Running)
                .unwrap(),
            JobState::Running
        );
        let err = JobState::Running
            .transition_to(JobId(4), JobState::Canceled)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition { job_id: JobId(4), from: JobState::Running, to: JobState::Canceled, ref allowed } if allowed.len() == 4
        ));
    }

    #[test]
    fn test_transition_table_size() {
        let mut allowed = 0;
        for from in JobState::ALL {
            for to in JobState::ALL {
                if from != to && from.can_transition_to(to) {
                    allowed += 1;
                }
            }
        }
        // NEW: 2, PENDING: 2, RUNNING: 4
        assert_eq!(allowed, 8);
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        for state in JobState::ALL.iter().filter(|s| s.is_terminal()) {
            assert!(state.allowed_transitions().is_empty());
        }
    }
}
