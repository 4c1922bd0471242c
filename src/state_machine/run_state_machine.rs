use super::events::RunEvent;
use super::states::RunPhase;

/// Transition table shared by task runs, flow runs and flow step runs.
///
/// `Pending -> Running -> {Succeeded | Failed}` and `Pending | Running -> Cancelled`.
/// Terminal phases never move, and observed phases never regress in rank, so
/// applying the same or older engine data twice is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStateMachine;

impl RunStateMachine {
    /// Target phase for `event` from `current`, or `None` when nothing should change.
    pub fn determine_target_state(current: RunPhase, event: &RunEvent) -> Option<RunPhase> {
        if current.is_terminal() {
            return None;
        }

        let target = match event {
            RunEvent::Observed(observed) => *observed,
            RunEvent::ObservedAfterCancel(observed) => match observed {
                RunPhase::Succeeded => RunPhase::Succeeded,
                RunPhase::Failed | RunPhase::Cancelled | RunPhase::NotStarted => {
                    RunPhase::Cancelled
                }
                still_active => *still_active,
            },
            RunEvent::CancelTimedOut => RunPhase::Cancelled,
            RunEvent::SubmissionFailed(_) => RunPhase::Failed,
        };

        if target == current || target.rank() < current.rank() {
            return None;
        }

        Some(target)
    }
}
