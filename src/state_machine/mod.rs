// Run phase state machine
//
// Phases are plain values persisted on the run rows; transitions are decided
// here and applied by the store as compare-and-set updates.

pub mod events;
pub mod run_state_machine;
pub mod states;

pub use events::RunEvent;
pub use run_state_machine::RunStateMachine;
pub use states::RunPhase;
