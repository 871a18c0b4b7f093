//! Temperature controller driving heater, heater-pump and cooler GPIO lines.
//!
//! # Configuration
//!
//! ```toml
//! [[devices]]
//! id = "bath-controller"
//! type = "temperatureController"
//! implementation = "gpio"
//! dependencies = ["bath-thermometer"]
//! [devices.parameters]
//! thermometer = "bath-thermometer"
//! deadband = 0.5
//! heater = { gpio_id = "gpio0", pin = 17 }
//! heater_pump = { gpio_id = "gpio0", pin = 27 }
//! cooler = { gpio_id = "gpio0", numbering = "board", pin = 15, active_low = true }
//! ```

use super::simulated::ControllerBaseParams;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use microlab_core::capabilities::{ActuatorState, DigitalOutput, TemperatureController};
use microlab_core::driver::{
    parse_params, BuildContext, DeviceComponents, DeviceMetadata, DeviceType, DriverFactory,
    ResourceClaim,
};
use microlab_core::gpio::GpioPinRef;
use microlab_core::{DeviceResult, DriverError};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

const DRIVER: &str = "gpio-temperature-controller";

#[derive(Debug, Clone, Deserialize)]
struct GpioControllerParams {
    #[serde(flatten)]
    base: ControllerBaseParams,
    heater: GpioPinRef,
    heater_pump: GpioPinRef,
    cooler: GpioPinRef,
}

impl GpioControllerParams {
    fn pins(&self) -> [(&'static str, &GpioPinRef); 3] {
        [
            ("heater", &self.heater),
            ("heater_pump", &self.heater_pump),
            ("cooler", &self.cooler),
        ]
    }
}

/// Resolve a pin reference into a configured output line.
pub(crate) async fn open_output(
    ctx: &BuildContext,
    role: &str,
    pin: &GpioPinRef,
) -> Result<Arc<dyn DigitalOutput>> {
    let bcm = pin.bcm_pin().with_context(|| format!("{} pin {}", role, pin))?;
    let controller = ctx.gpio_controller(&pin.gpio_id)?;
    let output = controller
        .output(bcm, pin.active_low)
        .await
        .with_context(|| format!("configuring {} pin {}", role, pin))?;
    Ok(output)
}

pub struct GpioTemperatureController {
    thermometer_id: String,
    deadband: f64,
    heater: Arc<dyn DigitalOutput>,
    heater_pump: Arc<dyn DigitalOutput>,
    cooler: Arc<dyn DigitalOutput>,
    state: Mutex<ActuatorState>,
}

impl GpioTemperatureController {
    pub fn new(
        thermometer_id: impl Into<String>,
        deadband: f64,
        heater: Arc<dyn DigitalOutput>,
        heater_pump: Arc<dyn DigitalOutput>,
        cooler: Arc<dyn DigitalOutput>,
    ) -> Self {
        Self {
            thermometer_id: thermometer_id.into(),
            deadband,
            heater,
            heater_pump,
            cooler,
            state: Mutex::new(ActuatorState::Idle),
        }
    }

    async fn write_outputs(&self, command: ActuatorState) -> DeviceResult<()> {
        let wanted = command.outputs();
        let lines = [
            (&self.heater, wanted.heater),
            (&self.heater_pump, wanted.heater_pump),
            (&self.cooler, wanted.cooler),
        ];
        // Offs first, so heater and cooler are never on together mid-switch.
        for (line, on) in lines.iter() {
            if !*on {
                line.set_active(false).await?;
            }
        }
        for (line, on) in lines.iter() {
            if *on {
                line.set_active(true).await?;
            }
        }
        Ok(())
    }

    async fn all_off(&self) -> DeviceResult<()> {
        let mut result = Ok(());
        for line in [&self.heater, &self.heater_pump, &self.cooler] {
            if let Err(e) = line.set_active(false).await {
                result = Err(e);
            }
        }
        result
    }
}

#[async_trait]
impl TemperatureController for GpioTemperatureController {
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
        match self.write_outputs(command).await {
            Ok(()) => {
                *self.state.lock() = command;
                Ok(())
            }
            Err(e) => {
                error!(command = %command, error = %e, "actuator write failed, switching outputs off");
                if self.all_off().await.is_ok() {
                    *self.state.lock() = ActuatorState::Idle;
                }
                Err(DriverError::communication(
                    DRIVER,
                    format!("failed to apply {}: {}", command, e),
                ))
            }
        }
    }
}

pub struct GpioTemperatureControllerFactory;

impl DriverFactory for GpioTemperatureControllerFactory {
    fn device_type(&self) -> DeviceType {
        DeviceType::TemperatureController
    }

    fn implementation(&self) -> &'static str {
        "gpio"
    }

    fn name(&self) -> &'static str {
        "GPIO Temperature Controller"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: GpioControllerParams = parse_params(DRIVER, params)?;
        params.base.validate()?;
        for (role, pin) in params.pins() {
            pin.bcm_pin().with_context(|| format!("{} pin {}", role, pin))?;
        }
        Ok(())
    }

    fn resource_claims(&self, params: &toml::Value) -> Result<Vec<ResourceClaim>> {
        let params: GpioControllerParams = parse_params(DRIVER, params)?;
        params
            .pins()
            .iter()
            .map(|(role, pin)| pin.claim().with_context(|| format!("{} pin {}", role, pin)))
            .collect()
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: GpioControllerParams = parse_params(DRIVER, &ctx.params)?;
            ctx.dependencies.thermometer(&params.base.thermometer)?;

            let heater = open_output(&ctx, "heater", &params.heater).await?;
            let heater_pump = open_output(&ctx, "heater_pump", &params.heater_pump).await?;
            let cooler = open_output(&ctx, "cooler", &params.cooler).await?;

            info!(
                device_id = %ctx.device_id,
                thermometer = %params.base.thermometer,
                heater = %params.heater,
                heater_pump = %params.heater_pump,
                cooler = %params.cooler,
                "GPIO temperature controller ready"
            );

            let controller = Arc::new(GpioTemperatureController::new(
                params.base.thermometer,
                params.base.deadband,
                heater,
                heater_pump,
                cooler,
            ));
            Ok(DeviceComponents::new()
                .with_temperature_controller(controller)
                .with_metadata(DeviceMetadata::default()))
        })
    }
}
