//! Hardware configuration: schema, validation and loading.
//!
//! The configuration system consists of three layers:
//!
//! 1. **Schema** - `[[gpio]]` controllers and `[[devices]]` entries
//! 2. **Validation** - per-field rules (`serde_valid`) plus cross-entry rules:
//!    unique ids, resolvable dependencies, known GPIO implementations
//! 3. **Loader** - figment-based loading from TOML files or strings
//!
//! # Example Configuration
//!
//! ```toml
//! [[gpio]]
//! id = "gpio0"
//! implementation = "sysfs"
//!
//! [[devices]]
//! id = "thermo"
//! type = "thermometer"
//! implementation = "ds18b20"
//! [devices.parameters]
//! sensor_id = "28-00000a1b2c3d"
//!
//! [[devices]]
//! id = "ctrl"
//! type = "temperatureController"
//! implementation = "gpio"
//! dependencies = ["thermo"]
//! [devices.parameters]
//! thermometer = "thermo"
//! deadband = 0.5
//! heater = { gpio_id = "gpio0", pin = 17 }
//! heater_pump = { gpio_id = "gpio0", pin = 27 }
//! cooler = { gpio_id = "gpio0", numbering = "board", pin = 15 }
//! ```
//!
//! Resource conflicts (two devices on one pin or serial port) need the driver
//! factories to interpret parameters, so they are checked by the registry
//! during bring-up rather than here.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_hardware_config, load_hardware_config_from_str, ConfigLoadError};
pub use schema::{generate_json_schema, DeviceConfig, GpioControllerConfig, HardwareConfig};
pub use validation::{validate_hardware_config, ValidationError};
