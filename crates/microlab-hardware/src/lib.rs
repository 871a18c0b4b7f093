//! Hardware side of the microlab core.
//!
//! - [`config`]: `[[gpio]]` / `[[devices]]` schema, validation and loading
//! - [`graph`]: dependency ordering
//! - [`registry`]: driver catalog and device bring-up
//! - [`drivers`]: real and simulated device variants
//! - [`gpio`]: GPIO controllers shared by GPIO-backed devices
//! - [`locks`]: per-device execution locks

pub use microlab_core::capabilities;

pub mod config;
pub mod drivers;
pub mod gpio;
pub mod graph;
pub mod locks;
pub mod registry;

pub use config::{
    load_hardware_config, load_hardware_config_from_str, DeviceConfig, GpioControllerConfig,
    HardwareConfig,
};
pub use locks::{DeviceGuard, DeviceLocks};
pub use registry::{DeviceInfo, DeviceRegistry, DriverCatalog};
