//! `microlab-core`
//!
//! Core trait definitions and types shared by every microlab crate.
//!
//! ## Layout
//!
//! - [`capabilities`]: the per-device-type operation contracts (thermometer,
//!   temperature controller, reagent dispenser, stirrer)
//! - [`driver`]: the factory contract used by the device registry to build
//!   hardware or simulated variants from configuration
//! - [`gpio`]: logical pin references and the GPIO controller contract
//! - [`motion`]: volume/rate to step conversion for syringe pump axes
//! - [`thermal`]: the hysteresis decision and control samples
//! - [`error`]: the error taxonomy and its retry classification
//! - [`error_recovery`]: retry policy with exponential backoff

pub mod capabilities;
pub mod driver;
pub mod error;
pub mod error_recovery;
pub mod gpio;
pub mod motion;
pub mod serial;
pub mod thermal;

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
pub use capabilities::{
    ActuatorState, DigitalOutput, DispenseRequest, ReagentDispenser, Stirrer,
    TemperatureController, ThermalPlant, Thermometer,
};
pub use driver::{
    BuildContext, Capability, DependencyView, DeviceComponents, DeviceMetadata, DeviceType,
    DriverFactory, ResourceClaim,
};
pub use error::{DeviceResult, DriverError, DriverErrorKind, ErrorClass, LabError, LabResult};
