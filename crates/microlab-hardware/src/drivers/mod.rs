//! Built-in device drivers.
//!
//! | type                    | implementation | module               |
//! |-------------------------|----------------|----------------------|
//! | `thermometer`           | `ds18b20`      | [`ds18b20`]          |
//! | `thermometer`           | `simulated`    | [`simulated`]        |
//! | `temperatureController` | `gpio`         | [`gpio_controller`]  |
//! | `temperatureController` | `simulated`    | [`simulated`]        |
//! | `reagentDispenser`      | `gcode`        | [`gcode`]            |
//! | `reagentDispenser`      | `simulated`    | [`simulated`]        |
//! | `stirrer`               | `gpio`         | [`gpio_stirrer`]     |
//! | `stirrer`               | `simulated`    | [`simulated`]        |

pub mod ds18b20;
pub mod gcode;
pub mod gpio_controller;
pub mod gpio_stirrer;
pub mod simulated;

use crate::registry::DriverCatalog;

/// Register every built-in factory.
pub fn register_builtin_drivers(catalog: &mut DriverCatalog) {
    catalog.register(ds18b20::Ds18b20Factory);
    catalog.register(simulated::SimulatedThermometerFactory);
    catalog.register(gpio_controller::GpioTemperatureControllerFactory);
    catalog.register(simulated::SimulatedTemperatureControllerFactory);
    catalog.register(gcode::GcodeDispenserFactory);
    catalog.register(simulated::SimulatedDispenserFactory);
    catalog.register(gpio_stirrer::GpioStirrerFactory);
    catalog.register(simulated::SimulatedStirrerFactory);
}
