//! Job and step status machines.

use serde::{Deserialize, Serialize};

/// Status of a job execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Created, worker not yet running
    Starting,
    /// Worker is executing steps
    Started,
    /// Stop requested, worker has not reached a chunk boundary yet
    Stopping,
    /// Worker halted at a chunk boundary; restartable via a new execution
    Stopped,
    /// All steps completed
    Completed,
    /// A step failed; cause is attached to the execution
    Failed,
    /// Marked as never to be restarted
    Abandoned,
}

impl BatchStatus {
    /// Terminal statuses accept no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Abandoned
        )
    }

    /// Statuses in which a worker still owns the execution.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Failed -> Abandoned` is the only move out of a terminal status; it marks
    /// the execution without resuming any work.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Starting, Started | Stopping | Failed)
                | (Started, Stopping | Completed | Failed)
                | (Stopping, Stopped | Completed | Failed)
                | (Stopped, Abandoned)
                | (Failed, Abandoned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step run.
///
/// `Ready -> Executing -> (Committing <-> Executing) -> {Completed, Stopped, Failed}`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Ready,
    Executing,
    Committing,
    Completed,
    Stopped,
    Failed,
}

impl StepStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Stopped | StepStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Ready, Executing | Stopped | Failed)
                | (Executing, Committing | Completed | Stopped | Failed)
                | (Committing, Executing | Completed | Stopped | Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_admit_no_progress() {
        for terminal in [BatchStatus::Completed, BatchStatus::Abandoned] {
            for next in [
                BatchStatus::Starting,
                BatchStatus::Started,
                BatchStatus::Stopping,
                BatchStatus::Stopped,
                BatchStatus::Completed,
                BatchStatus::Failed,
                BatchStatus::Abandoned,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(!BatchStatus::Failed.can_transition_to(BatchStatus::Started));
        assert!(!BatchStatus::Failed.can_transition_to(BatchStatus::Completed));
    }

    #[test]
    fn stopped_execution_cannot_resume_in_place() {
        assert!(!BatchStatus::Stopped.can_transition_to(BatchStatus::Started));
        assert!(!BatchStatus::Stopped.can_transition_to(BatchStatus::Starting));
        assert!(BatchStatus::Stopped.can_transition_to(BatchStatus::Abandoned));
    }

    #[test]
    fn normal_lifecycle_is_allowed() {
        assert!(BatchStatus::Starting.can_transition_to(BatchStatus::Started));
        assert!(BatchStatus::Started.can_transition_to(BatchStatus::Stopping));
        assert!(BatchStatus::Stopping.can_transition_to(BatchStatus::Stopped));
        assert!(BatchStatus::Started.can_transition_to(BatchStatus::Completed));
    }

    #[test]
    fn status_serializes_in_upper_case() {
        let json = serde_json::to_string(&BatchStatus::Stopped).unwrap();
        assert_eq!(json, "\"STOPPED\"");
    }

    #[test]
    fn step_commit_loop() {
        assert!(StepStatus::Executing.can_transition_to(StepStatus::Committing));
        assert!(StepStatus::Committing.can_transition_to(StepStatus::Executing));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Executing));
        assert!(!StepStatus::Ready.can_transition_to(StepStatus::Committing));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        const ALL: [BatchStatus; 7] = [
            BatchStatus::Starting,
            BatchStatus::Started,
            BatchStatus::Stopping,
            BatchStatus::Stopped,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Abandoned,
        ];

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Any walk of legal transitions never re-enters STARTING and never
            /// leaves COMPLETED or ABANDONED.
            #[test]
            fn legal_walks_only_move_forward(choices in prop::collection::vec(0usize..7, 1..20)) {
                let mut current = BatchStatus::Starting;
                for choice in choices {
                    let next = ALL[choice];
                    if !current.can_transition_to(next) {
                        continue;
                    }
                    prop_assert_ne!(next, BatchStatus::Starting);
                    prop_assert!(!matches!(current, BatchStatus::Completed | BatchStatus::Abandoned));
                    if current.is_terminal() {
                        prop_assert_eq!(next, BatchStatus::Abandoned);
                    }
                    current = next;
                }
            }
        }
    }
}
