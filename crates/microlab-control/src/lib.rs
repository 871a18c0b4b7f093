//! Hysteresis temperature control for the microlab core.
//!
//! One [`ControlLoop`] drives one temperature controller from the
//! thermometer it was configured against. The loop is steered and observed
//! through a [`ControlHandle`].

pub mod config;
pub mod control_loop;
pub mod state;

pub use config::ControlLoopConfig;
pub use control_loop::{ControlHandle, ControlLoop, ControlStatus, TickOutcome};
pub use state::{Evaluation, LoopState};
