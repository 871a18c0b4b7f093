//! Loop working state and the per-tick decision.
//!
//! Kept free of I/O so the fail-safe rules can be exercised directly.

use microlab_core::capabilities::ActuatorState;
use microlab_core::thermal::{decide, ControlSample};

/// What a tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Evaluation {
    /// State to write to the controller, if it differs from what is applied.
    pub command: Option<ActuatorState>,
    /// This tick reached the failure threshold.
    pub fault_raised: bool,
    /// This tick's successful read ended a fault.
    pub fault_cleared: bool,
}

#[derive(Debug, Clone)]
pub struct LoopState {
    failure_threshold: u32,
    consecutive_failures: u32,
    faulted: bool,
    current: Option<ControlSample>,
    previous: Option<ControlSample>,
}

impl LoopState {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
            faulted: false,
            current: None,
            previous: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn current(&self) -> Option<ControlSample> {
        self.current
    }

    pub fn previous(&self) -> Option<ControlSample> {
        self.previous
    }

    /// Decide one tick.
    ///
    /// `reading` is `None` when the thermometer read failed. `applied` is
    /// the state the controller last applied.
    pub fn evaluate(
        &mut self,
        reading: Option<f64>,
        applied: ActuatorState,
        target: Option<f64>,
        deadband: f64,
    ) -> Evaluation {
        match reading {
            Some(temperature) => {
                let fault_cleared = std::mem::take(&mut self.faulted);
                self.consecutive_failures = 0;

                let decision = match target {
                    Some(target) => decide(temperature, target, deadband),
                    None => applied,
                };
                self.previous = self.current.replace(ControlSample::now(temperature, decision));

                Evaluation {
                    command: (target.is_some() && decision != applied).then_some(decision),
                    fault_raised: false,
                    fault_cleared,
                }
            }
            None => {
                // Below the threshold the previous state is held.
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures < self.failure_threshold {
                    return Evaluation::default();
                }

                let fault_raised = !self.faulted;
                self.faulted = true;
                let force_idle = fault_raised || applied != ActuatorState::Idle;
                Evaluation {
                    command: force_idle.then_some(ActuatorState::Idle),
                    fault_raised,
                    fault_cleared: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActuatorState::*;

    const TARGET: Option<f64> = Some(37.0);

    #[test]
    fn hysteresis_around_target() {
        let mut state = LoopState::new(3);

        let e = state.evaluate(Some(36.0), Idle, TARGET, 0.5);
        assert_eq!(e.command, Some(Heating));

        let e = state.evaluate(Some(37.6), Heating, TARGET, 0.5);
        assert_eq!(e.command, Some(Cooling));

        let e = state.evaluate(Some(37.2), Cooling, TARGET, 0.5);
        assert_eq!(e.command, Some(Idle));

        // inside the band and already idle: nothing to write
        let e = state.evaluate(Some(36.8), Idle, TARGET, 0.5);
        assert_eq!(e.command, None);

        assert_eq!(state.current().unwrap().temperature, 36.8);
        assert_eq!(state.previous().unwrap().temperature, 37.2);
    }

    #[test]
    fn failures_hold_then_force_idle() {
        let mut state = LoopState::new(3);
        state.evaluate(Some(36.0), Idle, TARGET, 0.5);

        assert_eq!(state.evaluate(None, Heating, TARGET, 0.5), Evaluation::default());
        assert_eq!(state.evaluate(None, Heating, TARGET, 0.5), Evaluation::default());
        assert_eq!(state.consecutive_failures(), 2);
        assert!(!state.is_faulted());

        let e = state.evaluate(None, Heating, TARGET, 0.5);
        assert_eq!(e.command, Some(Idle));
        assert!(e.fault_raised);
        assert!(state.is_faulted());

        // stays idle, no repeated fault
        let e = state.evaluate(None, Idle, TARGET, 0.5);
        assert_eq!(e, Evaluation::default());

        // something switched the heater back on while faulted
        let e = state.evaluate(None, Heating, TARGET, 0.5);
        assert_eq!(e.command, Some(Idle));
        assert!(!e.fault_raised);
    }

    #[test]
    fn successful_read_clears_fault_and_resumes() {
        let mut state = LoopState::new(1);
        assert!(state.evaluate(None, Idle, TARGET, 0.5).fault_raised);

        let e = state.evaluate(Some(35.0), Idle, TARGET, 0.5);
        assert!(e.fault_cleared);
        assert_eq!(e.command, Some(Heating));
        assert_eq!(state.consecutive_failures(), 0);
        assert!(!state.is_faulted());
    }

    #[test]
    fn without_target_only_monitors() {
        let mut state = LoopState::new(3);
        let e = state.evaluate(Some(50.0), Idle, None, 0.5);
        assert_eq!(e.command, None);
        assert_eq!(state.current().unwrap().decision, Idle);
    }
}
