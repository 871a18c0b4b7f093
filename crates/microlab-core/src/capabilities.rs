//! Device Capabilities
//!
//! One narrow trait per device type. Every configured device provides exactly
//! the capability of its type, implemented by a hardware variant or a
//! simulation variant; consumers never know which.
//!
//! - [`Thermometer`]: one temperature reading per call
//! - [`TemperatureController`]: hysteresis decision plus actuator writes
//! - [`ReagentDispenser`]: calibrated syringe pump moves
//! - [`Stirrer`]: on/off
//!
//! Supporting traits used by implementations:
//!
//! - [`DigitalOutput`]: a single claimed GPIO output line
//! - [`ThermalPlant`]: something that reacts to actuator state (the simulated
//!   thermal model)
//!
//! # Design
//!
//! Each trait:
//! - Is async (uses `#[async_trait]`)
//! - Is thread-safe (requires `Send + Sync`)
//! - Returns [`DeviceResult`] so callers can tell transient from permanent
//!   failures without string matching

use crate::error::{DeviceResult, DriverError};
use crate::motion::{plan_dispense, MotionPlan, SyringePumpAxisConfig};
use crate::thermal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Actuator State
// =============================================================================

/// The single actuator state driving all temperature outputs.
///
/// Heater and cooler can never be active together: one enum value selects the
/// level of every output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorState {
    #[default]
    Idle,
    Heating,
    Cooling,
}

/// Output levels derived from an [`ActuatorState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorOutputs {
    pub heater: bool,
    pub heater_pump: bool,
    pub cooler: bool,
}

impl ActuatorState {
    /// Output levels for this state.
    pub fn outputs(self) -> ActuatorOutputs {
        match self {
            ActuatorState::Idle => ActuatorOutputs {
                heater: false,
                heater_pump: false,
                cooler: false,
            },
            ActuatorState::Heating => ActuatorOutputs {
                heater: true,
                heater_pump: true,
                cooler: false,
            },
            ActuatorState::Cooling => ActuatorOutputs {
                heater: false,
                heater_pump: false,
                cooler: true,
            },
        }
    }
}

impl std::fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuatorState::Idle => write!(f, "idle"),
            ActuatorState::Heating => write!(f, "heating"),
            ActuatorState::Cooling => write!(f, "cooling"),
        }
    }
}

// =============================================================================
// Thermometer
// =============================================================================

/// Capability: read a temperature in degrees Celsius.
///
/// # Contract
/// - Each call performs one fresh reading
/// - Transient failures (bus busy, CRC mismatch, timeout) are returned as
///   errors and never replaced by a default value
#[async_trait]
pub trait Thermometer: Send + Sync {
    /// Read the current temperature (°C).
    async fn read_temperature(&self) -> DeviceResult<f64>;
}

// =============================================================================
// Temperature Controller
// =============================================================================

/// Capability: drive heater, heater-pump and cooler outputs.
///
/// The controller does not read temperatures itself. It names the thermometer
/// it was configured against and the control loop looks that device up in the
/// registry.
#[async_trait]
pub trait TemperatureController: Send + Sync {
    /// Id of the thermometer this controller depends on.
    fn thermometer_id(&self) -> &str;

    /// Half-width of the band around the target with no actuator change (°C).
    fn deadband(&self) -> f64;

    /// Pure decision for a reading and a target.
    fn tick(&self, current: f64, target: f64) -> ActuatorState {
        thermal::decide(current, target, self.deadband())
    }

    /// Last state successfully applied to the outputs.
    fn state(&self) -> ActuatorState;

    /// Drive the outputs to `command`.
    ///
    /// Outputs being switched off are written before outputs being switched
    /// on. On failure the implementation tries to leave every output off.
    async fn apply(&self, command: ActuatorState) -> DeviceResult<()>;
}

// =============================================================================
// Reagent Dispenser
// =============================================================================

/// A dispense request for one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispenseRequest {
    /// Axis label as configured (e.g. "A").
    pub axis: String,
    /// Volume to dispense in milliliters.
    pub volume_ml: f64,
    /// Requested rate in ml/min; `None` runs at the axis maximum.
    #[serde(default)]
    pub rate_ml_per_min: Option<f64>,
}

impl DispenseRequest {
    pub fn new(axis: impl Into<String>, volume_ml: f64) -> Self {
        Self {
            axis: axis.into(),
            volume_ml,
            rate_ml_per_min: None,
        }
    }

    pub fn with_rate(mut self, rate_ml_per_min: f64) -> Self {
        self.rate_ml_per_min = Some(rate_ml_per_min);
        self
    }
}

/// Capability: dispense calibrated volumes from a stepper-driven syringe pump.
#[async_trait]
pub trait ReagentDispenser: Send + Sync {
    /// Configured axis labels.
    fn axes(&self) -> Vec<String>;

    /// Calibration for one axis.
    fn axis_config(&self, axis: &str) -> Option<SyringePumpAxisConfig>;

    /// Driver name used in error messages.
    fn driver_name(&self) -> &'static str;

    /// Compute the motion for a request without moving anything.
    fn plan(&self, request: &DispenseRequest) -> DeviceResult<MotionPlan> {
        let cfg = self.axis_config(&request.axis).ok_or_else(|| {
            DriverError::invalid_parameter(
                self.driver_name(),
                format!("unknown axis '{}'", request.axis),
            )
        })?;
        plan_dispense(request.volume_ml, request.rate_ml_per_min, &cfg)
            .map_err(|e| DriverError::invalid_parameter(self.driver_name(), e.to_string()))
    }

    /// Dispense and wait for physical completion.
    ///
    /// Returns the executed plan, including whether the rate was clamped.
    async fn dispense(&self, request: DispenseRequest) -> DeviceResult<MotionPlan>;
}

// =============================================================================
// Stirrer
// =============================================================================

/// Capability: switch a stirrer on or off.
#[async_trait]
pub trait Stirrer: Send + Sync {
    async fn set_running(&self, running: bool) -> DeviceResult<()>;

    fn is_running(&self) -> bool;
}

// =============================================================================
// Supporting traits
// =============================================================================

/// One claimed GPIO output line.
#[async_trait]
pub trait DigitalOutput: Send + Sync {
    /// Drive the line to its active (`true`) or inactive level.
    ///
    /// Active-low wiring is handled by the implementation.
    async fn set_active(&self, active: bool) -> DeviceResult<()>;

    /// Last level written.
    fn is_active(&self) -> bool;
}

/// A physical process that reacts to actuator state.
pub trait ThermalPlant: Send + Sync {
    fn drive(&self, state: ActuatorState);
}
