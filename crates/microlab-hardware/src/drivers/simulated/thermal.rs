//! Simulated thermometer, temperature controller and the thermal model they
//! share.
//!
//! The model is first order:
//!
//! ```text
//! dT/dt = heat_rate * heating - cool_rate * cooling - loss_rate * (T - ambient)
//! ```
//!
//! integrated lazily whenever the temperature is read or the actuator state
//! changes. `time_scale` speeds the simulation up relative to wall time.

use super::faults::{FaultConfig, FaultInjector};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use microlab_core::capabilities::{
    ActuatorState, TemperatureController, ThermalPlant, Thermometer,
};
use microlab_core::driver::{
    parse_params, BuildContext, DeviceComponents, DeviceMetadata, DeviceType, DriverFactory,
};
use microlab_core::thermal::DEFAULT_DEADBAND_C;
use microlab_core::DeviceResult;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::Instant;

const THERMOMETER_DRIVER: &str = "simulated-thermometer";
const CONTROLLER_DRIVER: &str = "simulated-temperature-controller";

// =============================================================================
// Thermal model
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ThermalModelConfig {
    #[serde(default = "default_temperature")]
    pub initial_temperature: f64,
    #[serde(default = "default_temperature")]
    pub ambient_temperature: f64,
    /// °C/s added while heating.
    #[serde(default = "default_heat_rate")]
    pub heat_rate: f64,
    /// °C/s removed while cooling.
    #[serde(default = "default_cool_rate")]
    pub cool_rate: f64,
    /// Fraction of the difference to ambient lost per second.
    #[serde(default = "default_loss_rate")]
    pub loss_rate: f64,
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
}

fn default_temperature() -> f64 {
    22.0
}
fn default_heat_rate() -> f64 {
    0.05
}
fn default_cool_rate() -> f64 {
    0.04
}
fn default_loss_rate() -> f64 {
    0.001
}
fn default_time_scale() -> f64 {
    1.0
}

impl Default for ThermalModelConfig {
    fn default() -> Self {
        Self {
            initial_temperature: default_temperature(),
            ambient_temperature: default_temperature(),
            heat_rate: default_heat_rate(),
            cool_rate: default_cool_rate(),
            loss_rate: default_loss_rate(),
            time_scale: default_time_scale(),
        }
    }
}

impl ThermalModelConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("heat_rate", self.heat_rate),
            ("cool_rate", self.cool_rate),
            ("loss_rate", self.loss_rate),
            ("time_scale", self.time_scale),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{} must be a non-negative number (got {})", name, value);
            }
        }
        Ok(())
    }
}

struct ModelState {
    temperature: f64,
    actuators: ActuatorState,
    updated: Instant,
}

/// Shared simulated bath temperature.
pub struct ThermalModel {
    config: ThermalModelConfig,
    state: Mutex<ModelState>,
}

impl ThermalModel {
    pub fn new(config: ThermalModelConfig) -> Self {
        let state = ModelState {
            temperature: config.initial_temperature,
            actuators: ActuatorState::Idle,
            updated: Instant::now(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn advance(&self, state: &mut ModelState) {
        let now = Instant::now();
        let dt = now.duration_since(state.updated).as_secs_f64() * self.config.time_scale;
        state.updated = now;
        if dt <= 0.0 {
            return;
        }
        let input = match state.actuators {
            ActuatorState::Heating => self.config.heat_rate,
            ActuatorState::Cooling => -self.config.cool_rate,
            ActuatorState::Idle => 0.0,
        };
        let loss = self.config.loss_rate * (state.temperature - self.config.ambient_temperature);
        state.temperature += (input - loss) * dt;
    }

    /// Current simulated temperature.
    pub fn temperature(&self) -> f64 {
        let mut state = self.state.lock();
        self.advance(&mut state);
        state.temperature
    }

    /// Overwrite the simulated temperature.
    pub fn set_temperature(&self, temperature: f64) {
        let mut state = self.state.lock();
        self.advance(&mut state);
        state.temperature = temperature;
    }

    pub fn actuators(&self) -> ActuatorState {
        self.state.lock().actuators
    }
}

impl ThermalPlant for ThermalModel {
    fn drive(&self, actuators: ActuatorState) {
        let mut state = self.state.lock();
        self.advance(&mut state);
        state.actuators = actuators;
    }
}

// =============================================================================
// Simulated thermometer
// =============================================================================

pub struct SimulatedThermometer {
    model: Arc<ThermalModel>,
    noise: f64,
    faults: FaultInjector,
}

impl SimulatedThermometer {
    pub fn new(model: Arc<ThermalModel>, noise: f64, faults: FaultInjector) -> Self {
        Self {
            model,
            noise,
            faults,
        }
    }

    pub fn model(&self) -> &Arc<ThermalModel> {
        &self.model
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

#[async_trait]
impl Thermometer for SimulatedThermometer {
    async fn read_temperature(&self) -> DeviceResult<f64> {
        self.faults.check(THERMOMETER_DRIVER, "read_temperature")?;
        Ok(self.model.temperature() + self.faults.rng().jitter(self.noise))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SimulatedThermometerParams {
    #[serde(flatten)]
    model: ThermalModelConfig,
    /// Peak uniform noise added to readings (°C).
    #[serde(default)]
    noise: f64,
    #[serde(default)]
    faults: FaultConfig,
}

pub struct SimulatedThermometerFactory;

impl DriverFactory for SimulatedThermometerFactory {
    fn device_type(&self) -> DeviceType {
        DeviceType::Thermometer
    }

    fn implementation(&self) -> &'static str {
        "simulated"
    }

    fn name(&self) -> &'static str {
        "Simulated Thermometer"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: SimulatedThermometerParams = parse_params(THERMOMETER_DRIVER, params)?;
        params.model.validate()?;
        params.faults.validate()?;
        if !params.noise.is_finite() || params.noise < 0.0 {
            bail!("noise must be a non-negative number");
        }
        Ok(())
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: SimulatedThermometerParams =
                parse_params(THERMOMETER_DRIVER, &ctx.params)?;
            let model = Arc::new(ThermalModel::new(params.model));
            let thermometer = Arc::new(SimulatedThermometer::new(
                model.clone(),
                params.noise,
                FaultInjector::new(params.faults),
            ));
            Ok(DeviceComponents::new()
                .with_thermometer(thermometer)
                .with_thermal_plant(model)
                .with_metadata(DeviceMetadata {
                    measurement_units: Some("°C".to_string()),
                    simulated: true,
                    ..Default::default()
                }))
        })
    }
}

// =============================================================================
// Simulated temperature controller
// =============================================================================

pub struct SimulatedTemperatureController {
    thermometer_id: String,
    deadband: f64,
    state: Mutex<ActuatorState>,
    plant: Option<Arc<dyn ThermalPlant>>,
    faults: FaultInjector,
}

impl SimulatedTemperatureController {
    pub fn new(
        thermometer_id: impl Into<String>,
        deadband: f64,
        plant: Option<Arc<dyn ThermalPlant>>,
        faults: FaultInjector,
    ) -> Self {
        Self {
            thermometer_id: thermometer_id.into(),
            deadband,
            state: Mutex::new(ActuatorState::Idle),
            plant,
            faults,
        }
    }
}

#[async_trait]
impl TemperatureController for SimulatedTemperatureController {
    fn thermometer_id(&self) -> &str {
        &self.thermometer_id
    }

    fn deadband(&self) -> f64 {
        self.deadband
    }

    fn state(&self) -> ActuatorState {
        *self.state.lock()
    }

    async fn apply(&self, command: ActuatorState) -> DeviceResult<()> {
        self.faults.check(CONTROLLER_DRIVER, "apply")?;
        *self.state.lock() = command;
        if let Some(plant) = &self.plant {
            plant.drive(command);
        }
        Ok(())
    }
}

fn default_deadband() -> f64 {
    DEFAULT_DEADBAND_C
}

/// Parameters shared by every temperature controller implementation.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerBaseParams {
    /// Thermometer device id; must also be listed in `dependencies`.
    pub thermometer: String,
    #[serde(default = "default_deadband")]
    pub deadband: f64,
}

impl ControllerBaseParams {
    pub fn validate(&self) -> Result<()> {
        if self.thermometer.is_empty() {
            bail!("thermometer must name a thermometer device");
        }
        if !self.deadband.is_finite() || self.deadband < 0.0 {
            bail!("deadband must be a non-negative number (got {})", self.deadband);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SimulatedControllerParams {
    #[serde(flatten)]
    base: ControllerBaseParams,
    #[serde(default)]
    faults: FaultConfig,
}

pub struct SimulatedTemperatureControllerFactory;

impl DriverFactory for SimulatedTemperatureControllerFactory {
    fn device_type(&self) -> DeviceType {
        DeviceType::TemperatureController
    }

    fn implementation(&self) -> &'static str {
        "simulated"
    }

    fn name(&self) -> &'static str {
        "Simulated Temperature Controller"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: SimulatedControllerParams = parse_params(CONTROLLER_DRIVER, params)?;
        params.base.validate()?;
        params.faults.validate()
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: SimulatedControllerParams = parse_params(CONTROLLER_DRIVER, &ctx.params)?;
            // Resolves only if the thermometer is a declared, live dependency.
            ctx.dependencies.thermometer(&params.base.thermometer)?;
            let plant = ctx.dependencies.thermal_plant(&params.base.thermometer);
            let controller = Arc::new(SimulatedTemperatureController::new(
                params.base.thermometer,
                params.base.deadband,
                plant,
                FaultInjector::new(params.faults),
            ));
            Ok(DeviceComponents::new()
                .with_temperature_controller(controller)
                .with_metadata(DeviceMetadata {
                    simulated: true,
                    ..Default::default()
                }))
        })
    }
}
