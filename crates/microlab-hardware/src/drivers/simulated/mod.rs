//! Simulation variants of every device type.
//!
//! Selected with `implementation = "simulated"`. All of them accept an
//! optional `[devices.parameters.faults]` table (see [`faults`]).

pub mod dispenser;
pub mod faults;
pub mod stirrer;
pub mod thermal;

pub use dispenser::{SimulatedDispenser, SimulatedDispenserFactory};
pub use faults::{FaultConfig, FaultInjector, InjectedKind};
pub use stirrer::{SimulatedStirrer, SimulatedStirrerFactory};
pub use thermal::{
    ControllerBaseParams, SimulatedTemperatureController, SimulatedTemperatureControllerFactory,
    SimulatedThermometer, SimulatedThermometerFactory, ThermalModel, ThermalModelConfig,
};
