//! GPIO controllers declared in `[[gpio]]`.
//!
//! - `sysfs`: Linux `/sys/class/gpio` export/direction/value files
//! - `simulated`: in-memory levels, for development machines and tests

pub mod simulated;
pub mod sysfs;

pub use simulated::SimulatedGpio;
pub use sysfs::SysfsGpio;

use crate::config::GpioControllerConfig;
use anyhow::{bail, Result};
use microlab_core::driver::{parse_params, GpioControllers};
use microlab_core::gpio::GpioController;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Implementation names accepted in `[[gpio]]` entries.
pub const GPIO_IMPLEMENTATIONS: &[&str] = &["sysfs", "simulated"];

/// Build every declared GPIO controller.
pub fn build_gpio_controllers(configs: &[GpioControllerConfig]) -> Result<GpioControllers> {
    let mut controllers: HashMap<String, Arc<dyn GpioController>> = HashMap::new();

    for config in configs {
        let controller: Arc<dyn GpioController> = match config.implementation.as_str() {
            "sysfs" => {
                let params: sysfs::SysfsParams = parse_params("sysfs", &config.parameters)?;
                Arc::new(SysfsGpio::new(&config.id, params.base_path))
            }
            "simulated" => Arc::new(SimulatedGpio::new(&config.id)),
            other => bail!(
                "unknown GPIO implementation '{}' for controller '{}'",
                other,
                config.id
            ),
        };
        info!(gpio_id = %config.id, implementation = %config.implementation, "GPIO controller ready");
        controllers.insert(config.id.clone(), controller);
    }

    Ok(Arc::new(controllers))
}
