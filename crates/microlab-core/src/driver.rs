//! Driver Factory and Component Types
//!
//! Every `(device type, implementation)` pair is served by one
//! [`DriverFactory`]. The registry collects factories into a catalog at
//! start-up and, for each configured device, picks the factory named by the
//! device's `implementation` string.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Composition Root (main.rs)              │
//! │  catalog.register(SimulatedThermometerFactory);                 │
//! │  catalog.register(Ds18b20Factory);                              │
//! │  catalog.register(GpioTemperatureControllerFactory);            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DeviceRegistry::bring_up                 │
//! │  topological order over `dependencies`                          │
//! │  factory.validate() / resource_claims() for every device        │
//! │  factory.build(BuildContext) strictly in order                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DriverFactory::build()                       │
//! │  Parses TOML parameters, looks dependencies up by id,           │
//! │  returns the device's capability                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::capabilities::{
    ReagentDispenser, Stirrer, TemperatureController, ThermalPlant, Thermometer,
};
use crate::gpio::GpioController;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Device Type
// =============================================================================

/// The four device types a microlab configuration may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceType {
    Thermometer,
    #[serde(alias = "temperature_controller")]
    TemperatureController,
    #[serde(alias = "reagent_dispenser")]
    ReagentDispenser,
    Stirrer,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thermometer => "thermometer",
            Self::TemperatureController => "temperatureController",
            Self::ReagentDispenser => "reagentDispenser",
            Self::Stirrer => "stirrer",
        }
    }

    /// The capability a device of this type must provide.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Thermometer => Capability::Thermometer,
            Self::TemperatureController => Capability::TemperatureController,
            Self::ReagentDispenser => Capability::ReagentDispenser,
            Self::Stirrer => Capability::Stirrer,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Corresponds to [`crate::capabilities::Thermometer`]
    Thermometer,
    /// Corresponds to [`crate::capabilities::TemperatureController`]
    TemperatureController,
    /// Corresponds to [`crate::capabilities::ReagentDispenser`]
    ReagentDispenser,
    /// Corresponds to [`crate::capabilities::Stirrer`]
    Stirrer,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Thermometer => "Thermometer",
            Self::TemperatureController => "Temperature Controller",
            Self::ReagentDispenser => "Reagent Dispenser",
            Self::Stirrer => "Stirrer",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Capability trait objects returned by a factory.
///
/// Cloning is cheap: every field is an `Arc`. Clones are what dependency
/// views hand to dependent factories.
#[derive(Clone, Default)]
pub struct DeviceComponents {
    pub thermometer: Option<Arc<dyn Thermometer>>,
    pub temperature_controller: Option<Arc<dyn TemperatureController>>,
    pub reagent_dispenser: Option<Arc<dyn ReagentDispenser>>,
    pub stirrer: Option<Arc<dyn Stirrer>>,

    /// Simulated thermal model a simulated controller may drive.
    pub thermal_plant: Option<Arc<dyn ThermalPlant>>,

    pub metadata: DeviceMetadata,
}

impl DeviceComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.thermometer.is_some() {
            caps.push(Capability::Thermometer);
        }
        if self.temperature_controller.is_some() {
            caps.push(Capability::TemperatureController);
        }
        if self.reagent_dispenser.is_some() {
            caps.push(Capability::ReagentDispenser);
        }
        if self.stirrer.is_some() {
            caps.push(Capability::Stirrer);
        }
        caps
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    // Builder methods

    pub fn with_thermometer(mut self, t: Arc<dyn Thermometer>) -> Self {
        self.thermometer = Some(t);
        self
    }

    pub fn with_temperature_controller(mut self, c: Arc<dyn TemperatureController>) -> Self {
        self.temperature_controller = Some(c);
        self
    }

    pub fn with_reagent_dispenser(mut self, d: Arc<dyn ReagentDispenser>) -> Self {
        self.reagent_dispenser = Some(d);
        self
    }

    pub fn with_stirrer(mut self, s: Arc<dyn Stirrer>) -> Self {
        self.stirrer = Some(s);
        self
    }

    pub fn with_thermal_plant(mut self, p: Arc<dyn ThermalPlant>) -> Self {
        self.thermal_plant = Some(p);
        self
    }

    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Descriptive metadata reported by a factory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceMetadata {
    /// Units of readings, e.g. "°C".
    pub measurement_units: Option<String>,
    /// Dispenser axis labels.
    pub axes: Vec<String>,
    /// Device is a simulation.
    pub simulated: bool,
}

// =============================================================================
// Resource Claims
// =============================================================================

/// A physical resource a device binds exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceClaim {
    /// A GPIO line, normalised to its BCM number.
    GpioPin { gpio_id: String, bcm_pin: u8 },
    /// A serial device path.
    SerialPort(String),
    /// A 1-wire sensor id.
    OneWireSensor(String),
}

impl std::fmt::Display for ResourceClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceClaim::GpioPin { gpio_id, bcm_pin } => {
                write!(f, "GPIO pin {}:BCM{}", gpio_id, bcm_pin)
            }
            ResourceClaim::SerialPort(path) => write!(f, "serial port {}", path),
            ResourceClaim::OneWireSensor(id) => write!(f, "1-wire sensor {}", id),
        }
    }
}

// =============================================================================
// Build Context
// =============================================================================

/// Read-only view of the devices a device declared as dependencies.
///
/// Only declared dependencies are visible, so a factory cannot reach devices
/// it did not declare.
#[derive(Clone, Default)]
pub struct DependencyView {
    devices: HashMap<String, DeviceComponents>,
}

impl DependencyView {
    pub fn new(devices: HashMap<String, DeviceComponents>) -> Self {
        Self { devices }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&DeviceComponents> {
        self.devices.get(id)
    }

    /// Look up a declared dependency that must be a thermometer.
    pub fn thermometer(&self, id: &str) -> Result<Arc<dyn Thermometer>> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| anyhow!("'{}' is not a declared dependency", id))?;
        device
            .thermometer
            .clone()
            .ok_or_else(|| anyhow!("dependency '{}' is not a thermometer", id))
    }

    /// Thermal model behind a dependency, if it has one.
    pub fn thermal_plant(&self, id: &str) -> Option<Arc<dyn ThermalPlant>> {
        self.devices.get(id).and_then(|d| d.thermal_plant.clone())
    }
}

/// GPIO controllers declared in the configuration, by id.
pub type GpioControllers = Arc<HashMap<String, Arc<dyn GpioController>>>;

/// Everything a factory receives to build one device.
#[derive(Clone)]
pub struct BuildContext {
    pub device_id: String,
    pub params: toml::Value,
    pub dependencies: DependencyView,
    pub gpio: GpioControllers,
}

impl BuildContext {
    pub fn new(device_id: impl Into<String>, params: toml::Value) -> Self {
        Self {
            device_id: device_id.into(),
            params,
            dependencies: DependencyView::default(),
            gpio: Arc::new(HashMap::new()),
        }
    }

    pub fn with_dependencies(mut self, dependencies: DependencyView) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_gpio(mut self, gpio: GpioControllers) -> Self {
        self.gpio = gpio;
        self
    }

    pub fn gpio_controller(&self, id: &str) -> Result<Arc<dyn GpioController>> {
        self.gpio
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown GPIO controller '{}'", id))
    }
}

/// Deserialize a factory's parameter table into its typed config.
pub fn parse_params<T: DeserializeOwned>(driver: &str, params: &toml::Value) -> Result<T> {
    params
        .clone()
        .try_into()
        .with_context(|| format!("invalid '{}' parameters", driver))
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for factories that create device instances.
///
/// # Lifetime
///
/// Factories are registered once at start-up and live for the program's
/// lifetime. They must be `Send + Sync + 'static`.
///
/// # Error Handling
///
/// `validate()` and `resource_claims()` run for every device before anything
/// is built, so configuration mistakes surface before any hardware is
/// touched. `build()` may fail on hardware connection problems; the registry
/// then aborts the whole bring-up.
pub trait DriverFactory: Send + Sync + 'static {
    /// Device type this factory builds.
    fn device_type(&self) -> DeviceType;

    /// Implementation name matched against the config `implementation` field.
    fn implementation(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Validate parameters without instantiating.
    fn validate(&self, params: &toml::Value) -> Result<()>;

    /// Physical resources the device will own.
    fn resource_claims(&self, _params: &toml::Value) -> Result<Vec<ResourceClaim>> {
        Ok(Vec::new())
    }

    /// Async instantiation; dependencies are already live.
    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_serde_accepts_both_spellings() {
        let t: DeviceType = serde_json::from_str("\"temperatureController\"").unwrap();
        assert_eq!(t, DeviceType::TemperatureController);
        let t: DeviceType = serde_json::from_str("\"reagent_dispenser\"").unwrap();
        assert_eq!(t, DeviceType::ReagentDispenser);
        assert_eq!(
            serde_json::to_string(&DeviceType::ReagentDispenser).unwrap(),
            "\"reagentDispenser\""
        );
    }

    #[test]
    fn empty_components_have_no_capabilities() {
        assert!(DeviceComponents::new().capabilities().is_empty());
    }

    #[test]
    fn dependency_view_rejects_undeclared_ids() {
        let view = DependencyView::default();
        let err = view.thermometer("thermo").err().unwrap();
        assert!(err.to_string().contains("not a declared dependency"));
    }

    #[test]
    fn claim_display() {
        let claim = ResourceClaim::GpioPin {
            gpio_id: "gpio0".into(),
            bcm_pin: 17,
        };
        assert_eq!(claim.to_string(), "GPIO pin gpio0:BCM17");
    }
}
