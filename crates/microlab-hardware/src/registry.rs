//! Device Registry
//!
//! Turns a [`HardwareConfig`] into live devices, or refuses to start.
//!
//! # Bring-up
//!
//! ```text
//! validate ──► topological order ──► factory lookup + validate ──► resource claims
//!                                                                        │
//!                 devices built in order ◄── GPIO controllers built ◄────┘
//! ```
//!
//! Every configuration check finishes before any hardware is touched. A
//! device that fails to build aborts the whole bring-up and everything built
//! so far is dropped. The registry is immutable afterwards; a changed
//! configuration means a restart.

use crate::config::loader::check;
use crate::config::{DeviceConfig, HardwareConfig};
use crate::drivers::register_builtin_drivers;
use crate::gpio::build_gpio_controllers;
use crate::graph::topological_order;
use crate::locks::DeviceLocks;
use microlab_core::capabilities::{ReagentDispenser, Stirrer, TemperatureController, Thermometer};
use microlab_core::driver::{
    BuildContext, Capability, DependencyView, DeviceComponents, DeviceMetadata, DeviceType,
    DriverFactory, GpioControllers, ResourceClaim,
};
use microlab_core::{LabError, LabResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Driver Catalog
// =============================================================================

/// Factories keyed by `(device type, implementation)`.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    factories: HashMap<(DeviceType, String), Arc<dyn DriverFactory>>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every built-in driver registered.
    pub fn with_builtin_drivers() -> Self {
        let mut catalog = Self::new();
        register_builtin_drivers(&mut catalog);
        catalog
    }

    /// Register a factory, replacing any previous one for the same key.
    pub fn register<F: DriverFactory>(&mut self, factory: F) {
        self.register_arc(Arc::new(factory));
    }

    pub fn register_arc(&mut self, factory: Arc<dyn DriverFactory>) {
        let device_type = factory.device_type();
        let implementation = factory.implementation();
        debug!(device_type = %device_type, implementation, "registered driver factory");
        self.factories
            .insert((device_type, implementation.to_string()), factory);
    }

    pub fn get(&self, device_type: DeviceType, implementation: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories
            .get(&(device_type, implementation.to_string()))
            .cloned()
    }

    /// Implementation names registered for a type, sorted.
    pub fn implementations(&self, device_type: DeviceType) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .factories
            .values()
            .filter(|f| f.device_type() == device_type)
            .map(|f| f.implementation())
            .collect();
        names.sort_unstable();
        names
    }
}

// =============================================================================
// Device Info (for introspection)
// =============================================================================

/// Information about a live device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub device_type: DeviceType,
    pub implementation: String,
    pub capabilities: Vec<Capability>,
    pub dependencies: Vec<String>,
    pub metadata: DeviceMetadata,
}

struct RegisteredDevice {
    config: DeviceConfig,
    components: DeviceComponents,
}

impl RegisteredDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.config.id.clone(),
            device_type: self.config.device_type,
            implementation: self.config.implementation.clone(),
            capabilities: self.components.capabilities(),
            dependencies: self.config.dependencies.clone(),
            metadata: self.components.metadata.clone(),
        }
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Live devices by id, their initialization order and their locks.
pub struct DeviceRegistry {
    devices: HashMap<String, RegisteredDevice>,
    init_order: Vec<String>,
    locks: DeviceLocks,
    gpio: GpioControllers,
}

fn config_error(message: impl Into<String>) -> LabError {
    LabError::Configuration(message.into())
}

impl DeviceRegistry {
    /// Build every configured device, dependencies first.
    pub async fn bring_up(config: &HardwareConfig, catalog: &DriverCatalog) -> LabResult<Self> {
        // Phase 1: structural validation
        check(config).map_err(|e| config_error(e.to_string()))?;

        // Phase 2: initialization order
        let order = topological_order(&config.devices).map_err(|e| config_error(e.to_string()))?;

        // Phase 3: factories and parameters
        let mut factories: HashMap<&str, Arc<dyn DriverFactory>> = HashMap::new();
        for device in &config.devices {
            let factory = catalog
                .get(device.device_type, &device.implementation)
                .ok_or_else(|| {
                    config_error(format!(
                        "device '{}': unknown {} implementation '{}' (available: {})",
                        device.id,
                        device.device_type,
                        device.implementation,
                        catalog.implementations(device.device_type).join(", ")
                    ))
                })?;
            factory.validate(&device.parameters).map_err(|e| {
                config_error(format!(
                    "device '{}' ({}): {:#}",
                    device.id,
                    factory.name(),
                    e
                ))
            })?;
            factories.insert(device.id.as_str(), factory);
        }

        // Phase 4: exclusive resources
        check_resource_claims(config, &factories)?;

        // Phase 5: GPIO controllers
        let gpio = build_gpio_controllers(&config.gpio)
            .map_err(|e| config_error(format!("GPIO controllers: {:#}", e)))?;

        // Phase 6: devices, strictly in order
        let mut devices: HashMap<String, RegisteredDevice> = HashMap::new();
        for id in &order {
            let device = config
                .device(id)
                .ok_or_else(|| LabError::UnknownDevice(id.clone()))?;
            let factory = factories
                .get(id.as_str())
                .ok_or_else(|| LabError::UnknownDevice(id.clone()))?;

            let dependencies = device
                .dependencies
                .iter()
                .filter_map(|dep| {
                    devices
                        .get(dep)
                        .map(|d| (dep.clone(), d.components.clone()))
                })
                .collect();
            let ctx = BuildContext::new(id.clone(), device.parameters.clone())
                .with_dependencies(DependencyView::new(dependencies))
                .with_gpio(gpio.clone());

            let components = factory.build(ctx).await.map_err(|e| {
                config_error(format!("failed to initialize device '{}': {:#}", id, e))
            })?;

            let capability = device.device_type.capability();
            if !components.has(capability) {
                return Err(LabError::CapabilityMismatch {
                    device_id: id.clone(),
                    capability: capability.name().to_string(),
                });
            }

            info!(
                device_id = %id,
                device_type = %device.device_type,
                implementation = %device.implementation,
                "device initialized"
            );
            devices.insert(
                id.clone(),
                RegisteredDevice {
                    config: device.clone(),
                    components,
                },
            );
        }

        info!(devices = devices.len(), order = ?order, "device bring-up complete");
        Ok(Self {
            locks: DeviceLocks::new(order.iter().cloned()),
            devices,
            init_order: order,
            gpio,
        })
    }

    /// Assemble a registry from devices that are already built.
    ///
    /// Dependencies are still ordered and checked, but no factory runs.
    pub fn from_parts(parts: Vec<(DeviceConfig, DeviceComponents)>) -> LabResult<Self> {
        let configs: Vec<DeviceConfig> = parts.iter().map(|(c, _)| c.clone()).collect();
        let mut seen = HashSet::new();
        if let Some(dup) = configs.iter().find(|c| !seen.insert(c.id.as_str())) {
            return Err(config_error(format!("duplicate device id '{}'", dup.id)));
        }
        let order = topological_order(&configs).map_err(|e| config_error(e.to_string()))?;

        let mut devices = HashMap::new();
        for (config, components) in parts {
            let capability = config.device_type.capability();
            if !components.has(capability) {
                return Err(LabError::CapabilityMismatch {
                    device_id: config.id,
                    capability: capability.name().to_string(),
                });
            }
            devices.insert(config.id.clone(), RegisteredDevice { config, components });
        }

        Ok(Self {
            locks: DeviceLocks::new(order.iter().cloned()),
            devices,
            init_order: order,
            gpio: Arc::new(HashMap::new()),
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.init_order
            .iter()
            .filter_map(|id| self.devices.get(id))
            .map(RegisteredDevice::info)
            .collect()
    }

    pub fn device_info(&self, id: &str) -> Option<DeviceInfo> {
        self.devices.get(id).map(RegisteredDevice::info)
    }

    pub fn device_type(&self, id: &str) -> Option<DeviceType> {
        self.devices.get(id).map(|d| d.config.device_type)
    }

    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        self.init_order
            .iter()
            .filter(|id| {
                self.devices
                    .get(id.as_str())
                    .is_some_and(|d| d.components.has(capability))
            })
            .cloned()
            .collect()
    }

    /// Ids in the order devices were built.
    pub fn init_order(&self) -> &[String] {
        &self.init_order
    }

    pub fn locks(&self) -> &DeviceLocks {
        &self.locks
    }

    pub fn gpio_controllers(&self) -> &GpioControllers {
        &self.gpio
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    pub fn thermometer(&self, id: &str) -> Option<Arc<dyn Thermometer>> {
        self.devices.get(id).and_then(|d| d.components.thermometer.clone())
    }

    pub fn temperature_controller(&self, id: &str) -> Option<Arc<dyn TemperatureController>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.temperature_controller.clone())
    }

    pub fn reagent_dispenser(&self, id: &str) -> Option<Arc<dyn ReagentDispenser>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.reagent_dispenser.clone())
    }

    pub fn stirrer(&self, id: &str) -> Option<Arc<dyn Stirrer>> {
        self.devices.get(id).and_then(|d| d.components.stirrer.clone())
    }

    fn require<T>(
        &self,
        id: &str,
        capability: Capability,
        found: Option<T>,
    ) -> LabResult<T> {
        match found {
            Some(device) => Ok(device),
            None if self.contains(id) => Err(LabError::CapabilityMismatch {
                device_id: id.to_string(),
                capability: capability.name().to_string(),
            }),
            None => Err(LabError::UnknownDevice(id.to_string())),
        }
    }

    pub fn require_thermometer(&self, id: &str) -> LabResult<Arc<dyn Thermometer>> {
        self.require(id, Capability::Thermometer, self.thermometer(id))
    }

    pub fn require_temperature_controller(
        &self,
        id: &str,
    ) -> LabResult<Arc<dyn TemperatureController>> {
        self.require(
            id,
            Capability::TemperatureController,
            self.temperature_controller(id),
        )
    }

    pub fn require_reagent_dispenser(&self, id: &str) -> LabResult<Arc<dyn ReagentDispenser>> {
        self.require(id, Capability::ReagentDispenser, self.reagent_dispenser(id))
    }

    pub fn require_stirrer(&self, id: &str) -> LabResult<Arc<dyn Stirrer>> {
        self.require(id, Capability::Stirrer, self.stirrer(id))
    }
}

/// Every claimed resource must be unique, and every pin must live on a
/// declared GPIO controller.
fn check_resource_claims(
    config: &HardwareConfig,
    factories: &HashMap<&str, Arc<dyn DriverFactory>>,
) -> LabResult<()> {
    let gpio_ids: HashSet<&str> = config.gpio.iter().map(|g| g.id.as_str()).collect();
    let mut owners: HashMap<ResourceClaim, &str> = HashMap::new();

    for device in &config.devices {
        let Some(factory) = factories.get(device.id.as_str()) else {
            continue;
        };
        let claims = factory
            .resource_claims(&device.parameters)
            .map_err(|e| config_error(format!("device '{}': {:#}", device.id, e)))?;

        for claim in claims {
            if let ResourceClaim::GpioPin { gpio_id, .. } = &claim {
                if !gpio_ids.contains(gpio_id.as_str()) {
                    return Err(config_error(format!(
                        "device '{}' uses undeclared GPIO controller '{}'",
                        device.id, gpio_id
                    )));
                }
            }
            if let Some(owner) = owners.get(&claim) {
                return Err(config_error(format!(
                    "{} is claimed by both '{}' and '{}'",
                    claim, owner, device.id
                )));
            }
            owners.insert(claim, device.id.as_str());
        }
    }
    Ok(())
}
