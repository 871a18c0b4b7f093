//! Operations a task may request, per device type.
//!
//! | Device type | Operation | Parameters |
//! |-------------|-----------|------------|
//! | thermometer | `read_temperature` | none |
//! | stirrer | `set_running` | `running` |
//! | stirrer | `stir` | `time` (s) |
//! | reagentDispenser | `dispense`, `pump` | `axis`/`pump`, `volume`, `rate?` |
//! | temperatureController | `heat`, `cool` | `temp`, `timeout?` (s) |
//! | temperatureController | `maintain` | `temp`, `tolerance`, `time`, `type` |
//! | temperatureController | `maintainHeat`, `maintainCool` | `temp`, `tolerance`, `time` |
//! | temperatureController | `set_target` / `clear_target` | `temp` / none |
//! | temperatureController | `idle` | none |
//!
//! Parsing happens when a worker picks the task up, so bad parameters fail
//! the task as permanent instead of being retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use microlab_control::ControlHandle;
use microlab_core::capabilities::{ActuatorState, DispenseRequest, TemperatureController};
use microlab_core::thermal::{decide, ControlMode};
use microlab_core::{DeviceType, DriverError, DriverErrorKind, LabError, LabResult};
use microlab_hardware::DeviceRegistry;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use serde_valid::Validate;
use tokio::time::Instant;
use tracing::debug;

/// Poll period of heat, cool and maintain.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Operation
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ReadTemperature,
    SetRunning {
        running: bool,
    },
    Stir {
        duration: Duration,
    },
    Dispense(DispenseRequest),
    /// Drive toward `target` in one direction, then idle.
    Ramp {
        direction: ActuatorState,
        target: f64,
        timeout: Option<Duration>,
    },
    Maintain {
        target: f64,
        tolerance: f64,
        duration: Duration,
        mode: ControlMode,
    },
    SetTarget {
        target: f64,
    },
    ClearTarget,
    Idle,
}

impl Operation {
    /// Interpret `name` and `params` for a device of `device_type`.
    pub fn parse(device_type: DeviceType, name: &str, params: &Value) -> LabResult<Self> {
        let op = match (device_type, name) {
            (DeviceType::Thermometer, "read_temperature") => Operation::ReadTemperature,

            (DeviceType::Stirrer, "set_running") => {
                let p: SetRunningParams = parse_params(name, params)?;
                Operation::SetRunning { running: p.running }
            }
            (DeviceType::Stirrer, "stir") => {
                let p: StirParams = parse_params(name, params)?;
                Operation::Stir {
                    duration: seconds(p.time),
                }
            }

            (DeviceType::ReagentDispenser, "dispense" | "pump") => {
                let p: DispenseParams = parse_params(name, params)?;
                let mut request = DispenseRequest::new(p.axis, p.volume);
                if let Some(rate) = p.rate {
                    request = request.with_rate(rate);
                }
                Operation::Dispense(request)
            }

            (DeviceType::TemperatureController, "heat" | "cool") => {
                let p: RampParams = parse_params(name, params)?;
                Operation::Ramp {
                    direction: if name == "heat" {
                        ActuatorState::Heating
                    } else {
                        ActuatorState::Cooling
                    },
                    target: p.temp,
                    timeout: p.timeout.map(seconds),
                }
            }
            (DeviceType::TemperatureController, "maintain" | "maintainHeat" | "maintainCool") => {
                let p: MaintainParams = parse_params(name, params)?;
                let mode = match name {
                    "maintainHeat" => ControlMode::Heat,
                    "maintainCool" => ControlMode::Cool,
                    _ => p.mode,
                };
                Operation::Maintain {
                    target: p.temp,
                    tolerance: p.tolerance,
                    duration: seconds(p.time),
                    mode,
                }
            }
            (DeviceType::TemperatureController, "set_target") => {
                let p: TargetParams = parse_params(name, params)?;
                Operation::SetTarget { target: p.temp }
            }
            (DeviceType::TemperatureController, "clear_target") => Operation::ClearTarget,
            (DeviceType::TemperatureController, "idle") => Operation::Idle,

            (device_type, name) => {
                return Err(LabError::InvalidParameters(format!(
                    "operation '{}' is not supported by {} devices",
                    name, device_type
                )))
            }
        };
        Ok(op)
    }

    /// Whether finishing this operation must leave the controller idle.
    fn idles_controller(&self) -> bool {
        matches!(
            self,
            Operation::Ramp { .. } | Operation::Maintain { .. } | Operation::Idle
        )
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

fn parse_params<P>(operation: &str, params: &Value) -> LabResult<P>
where
    P: DeserializeOwned + Validate,
{
    let params = match params {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    let parsed: P = serde_json::from_value(params).map_err(|e| {
        LabError::InvalidParameters(format!("{}: {}", operation, e))
    })?;
    parsed
        .validate()
        .map_err(|e| LabError::InvalidParameters(format!("{}: {}", operation, e)))?;
    Ok(parsed)
}

// =============================================================================
// Parameter Schemas
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
struct SetRunningParams {
    running: bool,
}

#[derive(Debug, Deserialize, Validate)]
struct StirParams {
    #[validate(minimum = 0.0)]
    time: f64,
}

#[derive(Debug, Deserialize, Validate)]
struct DispenseParams {
    #[serde(alias = "pump")]
    #[validate(min_length = 1)]
    axis: String,
    #[validate(exclusive_minimum = 0.0)]
    volume: f64,
    #[serde(default)]
    #[validate(exclusive_minimum = 0.0)]
    rate: Option<f64>,
}

#[derive(Debug, Deserialize, Validate)]
struct RampParams {
    temp: f64,
    #[serde(default)]
    #[validate(exclusive_minimum = 0.0)]
    timeout: Option<f64>,
}

fn default_tolerance() -> f64 {
    microlab_core::thermal::DEFAULT_DEADBAND_C
}

#[derive(Debug, Deserialize, Validate)]
struct MaintainParams {
    temp: f64,
    #[serde(default = "default_tolerance")]
    #[validate(minimum = 0.0)]
    tolerance: f64,
    #[validate(minimum = 0.0)]
    time: f64,
    #[serde(default, rename = "type")]
    mode: ControlMode,
}

#[derive(Debug, Deserialize, Validate)]
struct TargetParams {
    temp: f64,
}

// =============================================================================
// Execution
// =============================================================================

/// Everything an operation needs besides the device lock, which the
/// worker already holds.
#[derive(Clone)]
pub struct OperationContext {
    registry: Arc<DeviceRegistry>,
    control: HashMap<String, ControlHandle>,
    poll_interval: Duration,
}

impl OperationContext {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            control: HashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Route `set_target`/`clear_target` on `handle`'s controller to its loop.
    pub fn with_control(mut self, handle: ControlHandle) -> Self {
        self.control.insert(handle.status().controller_id, handle);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Resolve the device and parse the operation for its type.
    pub fn parse(&self, device_id: &str, name: &str, params: &Value) -> LabResult<Operation> {
        let device_type = self
            .registry
            .device_type(device_id)
            .ok_or_else(|| LabError::UnknownDevice(device_id.to_string()))?;
        Operation::parse(device_type, name, params)
    }

    /// Run `op` against `device_id` and return its JSON result.
    pub async fn execute(&self, device_id: &str, op: &Operation) -> LabResult<Value> {
        let device = |e: DriverError| LabError::device(device_id, e);

        match op {
            Operation::ReadTemperature => {
                let thermometer = self.registry.require_thermometer(device_id)?;
                let temperature = thermometer.read_temperature().await.map_err(device)?;
                Ok(json!({ "temperature": temperature }))
            }

            Operation::SetRunning { running } => {
                let stirrer = self.registry.require_stirrer(device_id)?;
                stirrer.set_running(*running).await.map_err(device)?;
                Ok(json!({ "running": running }))
            }
            Operation::Stir { duration } => {
                let stirrer = self.registry.require_stirrer(device_id)?;
                stirrer.set_running(true).await.map_err(device)?;
                tokio::time::sleep(*duration).await;
                // off on every path that turned it on
                stirrer.set_running(false).await.map_err(device)?;
                Ok(json!({ "stirred_secs": duration.as_secs_f64() }))
            }

            Operation::Dispense(request) => {
                let dispenser = self.registry.require_reagent_dispenser(device_id)?;
                let plan = dispenser.dispense(request.clone()).await.map_err(device)?;
                serde_json::to_value(plan).map_err(|e| LabError::Storage(e.to_string()))
            }

            Operation::SetTarget { target } => {
                self.control_handle(device_id)?.set_target(*target)?;
                Ok(json!({ "target": target }))
            }
            Operation::ClearTarget => {
                self.control_handle(device_id)?.clear_target();
                Ok(json!({ "target": null }))
            }

            Operation::Ramp { .. } | Operation::Maintain { .. } | Operation::Idle => {
                let controller = self.registry.require_temperature_controller(device_id)?;
                let outcome = self.drive(device_id, controller.as_ref(), op).await;
                if !op.idles_controller() {
                    return outcome;
                }
                let idled = controller.apply(ActuatorState::Idle).await.map_err(device);
                match (outcome, idled) {
                    (Ok(value), Ok(())) => Ok(value),
                    (Ok(_), Err(err)) => Err(err),
                    (Err(err), _) => Err(err),
                }
            }
        }
    }

    fn control_handle(&self, controller_id: &str) -> LabResult<&ControlHandle> {
        self.registry.require_temperature_controller(controller_id)?;
        self.control.get(controller_id).ok_or_else(|| {
            LabError::InvalidParameters(format!(
                "no control loop is running for '{}'",
                controller_id
            ))
        })
    }

    async fn drive(
        &self,
        device_id: &str,
        controller: &dyn TemperatureController,
        op: &Operation,
    ) -> LabResult<Value> {
        let apply = |state| async move {
            controller
                .apply(state)
                .await
                .map_err(|e| LabError::device(device_id, e))
        };

        match op {
            Operation::Ramp {
                direction,
                target,
                timeout,
            } => {
                let started = Instant::now();
                apply(*direction).await?;
                loop {
                    let temperature = self.read(controller.thermometer_id()).await?;
                    let reached = match direction {
                        ActuatorState::Cooling => temperature <= *target,
                        _ => temperature >= *target,
                    };
                    debug!(device_id, temperature, target, "ramp poll");
                    if reached {
                        return Ok(json!({
                            "temperature": temperature,
                            "elapsed_secs": started.elapsed().as_secs_f64(),
                        }));
                    }
                    if let Some(limit) = timeout {
                        if started.elapsed() >= *limit {
                            return Err(LabError::device(
                                device_id,
                                DriverError::new(
                                    "temperature_controller",
                                    DriverErrorKind::Hardware,
                                    format!(
                                        "{:.1} °C not reached within {:.0} s (last reading {:.2} °C)",
                                        target,
                                        limit.as_secs_f64(),
                                        temperature
                                    ),
                                ),
                            ));
                        }
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }

            Operation::Maintain {
                target,
                tolerance,
                duration,
                mode,
            } => {
                let started = Instant::now();
                let mut last = None;
                while started.elapsed() < *duration {
                    let temperature = self.read(controller.thermometer_id()).await?;
                    let next = maintain_step(
                        temperature,
                        *target,
                        *tolerance,
                        *mode,
                        controller.state(),
                    );
                    if next != controller.state() {
                        debug!(device_id, temperature, state = %next, "maintain switch");
                        apply(next).await?;
                    }
                    last = Some(temperature);
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(json!({
                    "temperature": last,
                    "elapsed_secs": started.elapsed().as_secs_f64(),
                }))
            }

            Operation::Idle => Ok(json!({ "state": ActuatorState::Idle })),

            _ => Err(LabError::InvalidParameters(format!(
                "{:?} is not a controller drive",
                op
            ))),
        }
    }

    /// Read a controller's thermometer under that thermometer's lock.
    async fn read(&self, thermometer_id: &str) -> LabResult<f64> {
        let thermometer = self.registry.require_thermometer(thermometer_id)?;
        let _guard = self
            .registry
            .locks()
            .acquire_timeout(thermometer_id, self.poll_interval * 4)
            .await?;
        thermometer
            .read_temperature()
            .await
            .map_err(|e| LabError::device(thermometer_id, e))
    }
}

/// Hysteresis with hold: outside the tolerance band the mode's direction
/// wins, inside it the applied state is kept.
pub fn maintain_step(
    current: f64,
    target: f64,
    tolerance: f64,
    mode: ControlMode,
    applied: ActuatorState,
) -> ActuatorState {
    match decide(current, target, tolerance) {
        ActuatorState::Idle => applied,
        outside => mode.restrict(outside),
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("control", &self.control.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
