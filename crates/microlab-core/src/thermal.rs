//! Hysteresis decision and control samples.

use crate::capabilities::ActuatorState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default deadband (°C) when a controller does not configure one.
pub const DEFAULT_DEADBAND_C: f64 = 0.5;

/// Bang-bang decision with a deadband around `target`.
///
/// - below `target - deadband`: heating
/// - above `target + deadband`: cooling
/// - otherwise: idle
pub fn decide(current: f64, target: f64, deadband: f64) -> ActuatorState {
    if current < target - deadband {
        ActuatorState::Heating
    } else if current > target + deadband {
        ActuatorState::Cooling
    } else {
        ActuatorState::Idle
    }
}

/// Which directions a decision may actuate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Heat below the band, cool above it.
    #[default]
    Both,
    /// Heat below the band, idle otherwise.
    Heat,
    /// Cool above the band, idle otherwise.
    Cool,
}

impl ControlMode {
    /// Restrict a decision to this mode.
    pub fn restrict(self, state: ActuatorState) -> ActuatorState {
        match (self, state) {
            (ControlMode::Heat, ActuatorState::Cooling) => ActuatorState::Idle,
            (ControlMode::Cool, ActuatorState::Heating) => ActuatorState::Idle,
            (_, state) => state,
        }
    }
}

/// A reading and the decision taken in response to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlSample {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub decision: ActuatorState,
}

impl ControlSample {
    pub fn now(temperature: f64, decision: ActuatorState) -> Self {
        Self {
            timestamp: Utc::now(),
            temperature,
            decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_around_37() {
        assert_eq!(decide(36.0, 37.0, 0.5), ActuatorState::Heating);
        assert_eq!(decide(37.6, 37.0, 0.5), ActuatorState::Cooling);
        assert_eq!(decide(37.2, 37.0, 0.5), ActuatorState::Idle);
        // band edges are inside the band
        assert_eq!(decide(36.5, 37.0, 0.5), ActuatorState::Idle);
        assert_eq!(decide(37.5, 37.0, 0.5), ActuatorState::Idle);
    }

    #[test]
    fn mode_restricts_direction() {
        assert_eq!(
            ControlMode::Heat.restrict(ActuatorState::Cooling),
            ActuatorState::Idle
        );
        assert_eq!(
            ControlMode::Cool.restrict(ActuatorState::Heating),
            ActuatorState::Idle
        );
        assert_eq!(
            ControlMode::Both.restrict(ActuatorState::Cooling),
            ActuatorState::Cooling
        );
    }
}
