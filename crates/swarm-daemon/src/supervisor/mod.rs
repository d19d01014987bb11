//! Supervisor loop: one task per active run, driving the run state machine
//! from agent exits, watchdog ticks and stop requests.

mod run;
mod watchdog;

pub use run::{
    CloseResult, RunClose, RunCloser, RunControl, RunDeps, RunParams, spawn_run_loop,
};
pub use watchdog::{RunState, TickVerdict, duration_from_hours, evaluate_tick};
