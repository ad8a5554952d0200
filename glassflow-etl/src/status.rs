//! Pipeline lifecycle states and the progressive status derived from
//! operator reports.

use serde::{Deserialize, Serialize};

use crate::operator::{OperatorReport, OperatorState};

/// Persisted lifecycle state of one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Creating,
    Running,
    Pausing,
    Paused,
    Resuming,
    Terminating,
    Terminated,
    Deleted,
    /// The persisted configuration failed to revalidate on recovery; the
    /// pipeline is parked and never auto-retried.
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Terminated | PipelineState::Deleted)
    }

    /// States that count against the single-active-pipeline policy.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Pause,
    Resume,
    Terminate,
    Delete,
}

/// The state an action moves a pipeline into, or `None` when the action is
/// illegal from that state. Repeating an in-flight or completed action is a
/// no-op, not an error.
pub fn transition(from: PipelineState, action: LifecycleAction) -> Option<PipelineState> {
    use LifecycleAction as A;
    use PipelineState as S;

    match (from, action) {
        (S::Running, A::Pause) => Some(S::Pausing),
        (S::Pausing, A::Pause) => Some(S::Pausing),
        (S::Paused, A::Pause) => Some(S::Paused),

        (S::Paused, A::Resume) => Some(S::Resuming),
        (S::Resuming, A::Resume) => Some(S::Resuming),
        (S::Running, A::Resume) => Some(S::Running),

        (S::Creating, A::Terminate)
        | (S::Running, A::Terminate)
        | (S::Pausing, A::Terminate)
        | (S::Paused, A::Terminate)
        | (S::Resuming, A::Terminate)
        | (S::Failed, A::Terminate) => Some(S::Terminating),
        (S::Terminating, A::Terminate) => Some(S::Terminating),

        (S::Terminated, A::Delete) => Some(S::Deleted),

        _ => None,
    }
}

/// Aggregated pipeline-level health label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressiveStatus {
    Running,
    /// Some operator is unhealthy but the pipeline is still processing.
    Degraded,
    Paused,
    Pausing,
    Resuming,
    Terminating,
    Terminated,
    /// An operator stopped unexpectedly and is not recovering.
    Failed,
}

pub fn aggregate(state: PipelineState, operators: &[OperatorReport]) -> ProgressiveStatus {
    match state {
        PipelineState::Pausing => ProgressiveStatus::Pausing,
        PipelineState::Paused => ProgressiveStatus::Paused,
        PipelineState::Resuming => ProgressiveStatus::Resuming,
        PipelineState::Terminating => ProgressiveStatus::Terminating,
        PipelineState::Terminated | PipelineState::Deleted => ProgressiveStatus::Terminated,
        PipelineState::Failed => ProgressiveStatus::Failed,
        PipelineState::Creating | PipelineState::Running => {
            if operators
                .iter()
                .any(|op| op.state == OperatorState::Stopped)
            {
                ProgressiveStatus::Failed
            } else if operators
                .iter()
                .any(|op| op.state == OperatorState::Unhealthy)
            {
                ProgressiveStatus::Degraded
            } else if operators
                .iter()
                .all(|op| op.state == OperatorState::Running)
            {
                ProgressiveStatus::Running
            } else {
                // Workers still starting up.
                ProgressiveStatus::Resuming
            }
        }
    }
}

/// Point-in-time view of one pipeline, as returned by the status read.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub pipeline_id: String,
    pub state: PipelineState,
    pub status: ProgressiveStatus,
    pub operators: Vec<OperatorReport>,
    pub dlq_depth: u64,
    /// Strictly increasing per pipeline; lets pollers order snapshots.
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, state: OperatorState) -> OperatorReport {
        OperatorReport {
            name: name.to_string(),
            state,
            last_success_ts: None,
            last_error: None,
            backlog_hint: 0,
        }
    }

    #[test]
    fn transition_table() {
        use LifecycleAction as A;
        use PipelineState as S;

        // (from, action, expected)
        let cases = vec![
            (S::Running, A::Pause, Some(S::Pausing)),
            (S::Paused, A::Pause, Some(S::Paused)),
            (S::Paused, A::Resume, Some(S::Resuming)),
            (S::Running, A::Resume, Some(S::Running)),
            (S::Running, A::Terminate, Some(S::Terminating)),
            (S::Paused, A::Terminate, Some(S::Terminating)),
            (S::Terminated, A::Pause, None),
            (S::Terminated, A::Resume, None),
            (S::Terminated, A::Terminate, None),
            (S::Terminated, A::Delete, Some(S::Deleted)),
            (S::Deleted, A::Delete, None),
            (S::Running, A::Delete, None),
            (S::Creating, A::Terminate, Some(S::Terminating)),
            (S::Failed, A::Terminate, Some(S::Terminating)),
            (S::Failed, A::Resume, None),
        ];

        for (from, action, expected) in cases {
            assert_eq!(
                transition(from, action),
                expected,
                "{from:?} + {action:?}"
            );
        }
    }

    #[test]
    fn paused_pipeline_reports_paused() {
        let ops = vec![report("ingestor", OperatorState::Paused)];
        assert_eq!(
            aggregate(PipelineState::Paused, &ops),
            ProgressiveStatus::Paused
        );
    }

    #[test]
    fn unhealthy_operator_degrades_a_running_pipeline() {
        let ops = vec![
            report("ingestor", OperatorState::Running),
            report("sink", OperatorState::Unhealthy),
        ];
        assert_eq!(
            aggregate(PipelineState::Running, &ops),
            ProgressiveStatus::Degraded
        );
    }

    #[test]
    fn stopped_operator_fails_a_running_pipeline() {
        let ops = vec![
            report("ingestor", OperatorState::Running),
            report("sink", OperatorState::Stopped),
        ];
        assert_eq!(
            aggregate(PipelineState::Running, &ops),
            ProgressiveStatus::Failed
        );
    }

    #[test]
    fn all_running_is_running() {
        let ops = vec![
            report("ingestor", OperatorState::Running),
            report("dedup", OperatorState::Running),
            report("sink", OperatorState::Running),
        ];
        assert_eq!(
            aggregate(PipelineState::Running, &ops),
            ProgressiveStatus::Running
        );
    }

    #[test]
    fn starting_workers_read_as_transitional() {
        let ops = vec![
            report("ingestor", OperatorState::Starting),
            report("sink", OperatorState::Running),
        ];
        assert_eq!(
            aggregate(PipelineState::Running, &ops),
            ProgressiveStatus::Resuming
        );
    }
}
