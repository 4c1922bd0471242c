//! # Phase Resolver
//!
//! Classifies the engine's partial, eventually consistent status reports into
//! a [`RunPhase`]. Pure functions: calling them repeatedly with the same
//! report always yields the same answer.

use crate::engine::{EnginePhase, EngineStatus, SubUnitStatus};
use crate::state_machine::RunPhase;

/// Phase of a whole run from the engine's report.
///
/// - no report (job unknown to the engine): `NotStarted`
/// - any failed or errored sub-unit, or a failed job: `Failed`, even while
///   other sub-units are still running
/// - job reported complete: `Succeeded`
/// - some sub-unit has started: `Running`
/// - otherwise: `Pending`
pub fn determine_run_phase(status: Option<&EngineStatus>) -> RunPhase {
    let Some(status) = status else {
        return RunPhase::NotStarted;
    };

    if status.phase.is_failure() || status.sub_units.iter().any(|u| u.phase.is_failure()) {
        return RunPhase::Failed;
    }
    if status.phase == EnginePhase::Succeeded {
        return RunPhase::Succeeded;
    }
    if status.sub_units.iter().any(|u| u.phase.has_started()) {
        return RunPhase::Running;
    }
    RunPhase::Pending
}

/// Phase of one step from its sub-unit's engine phase
pub fn sub_unit_phase(phase: EnginePhase) -> RunPhase {
    match phase {
        EnginePhase::Pending => RunPhase::Pending,
        EnginePhase::Running => RunPhase::Running,
        EnginePhase::Succeeded => RunPhase::Succeeded,
        EnginePhase::Failed | EnginePhase::Error => RunPhase::Failed,
        // never executed because an upstream step did not succeed
        EnginePhase::Skipped | EnginePhase::Omitted => RunPhase::Cancelled,
    }
}

/// The sub-unit that currently represents a step. Retries produce several
/// units per template; the most recently started one wins.
pub fn latest_sub_unit<'a>(
    status: &'a EngineStatus,
    template_name: &'a str,
) -> Option<&'a SubUnitStatus> {
    status
        .sub_units_for(template_name)
        .max_by(|a, b| a.started_at.cmp(&b.started_at))
}

/// Human readable reason for a failed report, preferring the failing sub-unit's message
pub fn failure_message(status: &EngineStatus) -> Option<String> {
    status
        .sub_units
        .iter()
        .filter(|u| u.phase.is_failure())
        .find_map(|u| {
            u.message
                .as_ref()
                .map(|message| format!("{}: {}", u.name, message))
        })
        .or_else(|| status.message.clone())
}
