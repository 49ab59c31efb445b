//! Run status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of the single active run.
///
/// State transitions:
/// - Initialization -> DataSync -> Training -> ResultsSync -> Cleanup -> (object deleted)
/// - any active status -> Failed | Killed
/// - Failed | Killed -> Cleanup
/// - Cleanup -> Cleanup (cleanup retry loop)
///
/// No variant is terminal: a run is only finished once its state object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialization,
    DataSync,
    Training,
    ResultsSync,
    Cleanup,
    Failed,
    Killed,
}

impl RunStatus {
    /// The four phases the executor drives, in order.
    pub const PHASES: [RunStatus; 4] = [
        RunStatus::Initialization,
        RunStatus::DataSync,
        RunStatus::Training,
        RunStatus::ResultsSync,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Initialization => "initialization",
            RunStatus::DataSync => "data_sync",
            RunStatus::Training => "training",
            RunStatus::ResultsSync => "results_sync",
            RunStatus::Cleanup => "cleanup",
            RunStatus::Failed => "failed",
            RunStatus::Killed => "killed",
        }
    }

    /// Position along the lifecycle. An observed sequence of statuses never decreases.
    pub fn step_index(self) -> u8 {
        match self {
            RunStatus::Initialization => 0,
            RunStatus::DataSync => 1,
            RunStatus::Training => 2,
            RunStatus::ResultsSync => 3,
            RunStatus::Failed | RunStatus::Killed => 4,
            RunStatus::Cleanup => 5,
        }
    }

    /// Is the phase loop still running (eligible for a jump to failed/killed)?
    pub fn is_active(self) -> bool {
        self.step_index() < 4
    }

    /// Has the run been aborted?
    pub fn is_aborted(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Killed)
    }

    /// Status the executor moves to when this phase succeeds.
    pub fn next_on_success(self) -> Option<RunStatus> {
        match self {
            RunStatus::Initialization => Some(RunStatus::DataSync),
            RunStatus::DataSync => Some(RunStatus::Training),
            RunStatus::Training => Some(RunStatus::ResultsSync),
            RunStatus::ResultsSync | RunStatus::Failed | RunStatus::Killed => {
                Some(RunStatus::Cleanup)
            }
            RunStatus::Cleanup => None,
        }
    }

    /// Is `self -> next` an allowed transition? Rewriting the same status is always allowed.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self == next {
            return true;
        }
        match next {
            RunStatus::Failed | RunStatus::Killed => self.is_active(),
            _ => self.next_on_success() == Some(next),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RunStatus::Initialization, RunStatus::DataSync)]
    #[case(RunStatus::DataSync, RunStatus::Training)]
    #[case(RunStatus::Training, RunStatus::ResultsSync)]
    #[case(RunStatus::ResultsSync, RunStatus::Cleanup)]
    #[case(RunStatus::Training, RunStatus::Failed)]
    #[case(RunStatus::Training, RunStatus::Killed)]
    #[case(RunStatus::Initialization, RunStatus::Failed)]
    #[case(RunStatus::Failed, RunStatus::Cleanup)]
    #[case(RunStatus::Killed, RunStatus::Cleanup)]
    #[case(RunStatus::Cleanup, RunStatus::Cleanup)]
    fn allowed_transitions(#[case] from: RunStatus, #[case] to: RunStatus) {
        assert!(from.can_transition_to(to), "{from} -> {to}");
    }

    #[rstest]
    #[case(RunStatus::Training, RunStatus::DataSync)]
    #[case(RunStatus::Initialization, RunStatus::Training)]
    #[case(RunStatus::Cleanup, RunStatus::Killed)]
    #[case(RunStatus::Cleanup, RunStatus::Failed)]
    #[case(RunStatus::Failed, RunStatus::Killed)]
    #[case(RunStatus::Killed, RunStatus::Training)]
    #[case(RunStatus::Failed, RunStatus::ResultsSync)]
    fn rejected_transitions(#[case] from: RunStatus, #[case] to: RunStatus) {
        assert!(!from.can_transition_to(to), "{from} -> {to}");
    }

    #[test]
    fn allowed_transitions_never_decrease_step_index() {
        let all = [
            RunStatus::Initialization,
            RunStatus::DataSync,
            RunStatus::Training,
            RunStatus::ResultsSync,
            RunStatus::Cleanup,
            RunStatus::Failed,
            RunStatus::Killed,
        ];
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    assert!(to.step_index() >= from.step_index(), "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&RunStatus::ResultsSync).unwrap();
        assert_eq!(s, "\"results_sync\"");
        let back: RunStatus = serde_json::from_str("\"data_sync\"").unwrap();
        assert_eq!(back, RunStatus::DataSync);
    }
}
