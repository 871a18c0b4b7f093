//! Stirrer switched by a single GPIO output.
//!
//! ```toml
//! [[devices]]
//! id = "stirrer"
//! type = "stirrer"
//! implementation = "gpio"
//! [devices.parameters]
//! pin = { gpio_id = "gpio0", pin = 23 }
//! ```

use super::gpio_controller::open_output;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use microlab_core::capabilities::{DigitalOutput, Stirrer};
use microlab_core::driver::{
    parse_params, BuildContext, DeviceComponents, DeviceMetadata, DeviceType, DriverFactory,
    ResourceClaim,
};
use microlab_core::gpio::GpioPinRef;
use microlab_core::DeviceResult;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

const DRIVER: &str = "gpio-stirrer";

#[derive(Debug, Clone, Deserialize)]
struct GpioStirrerParams {
    pin: GpioPinRef,
}

pub struct GpioStirrer {
    output: Arc<dyn DigitalOutput>,
}

impl GpioStirrer {
    pub fn new(output: Arc<dyn DigitalOutput>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl Stirrer for GpioStirrer {
    async fn set_running(&self, running: bool) -> DeviceResult<()> {
        self.output.set_active(running).await
    }

    fn is_running(&self) -> bool {
        self.output.is_active()
    }
}

pub struct GpioStirrerFactory;

impl DriverFactory for GpioStirrerFactory {
    fn device_type(&self) -> DeviceType {
        DeviceType::Stirrer
    }

    fn implementation(&self) -> &'static str {
        "gpio"
    }

    fn name(&self) -> &'static str {
        "GPIO Stirrer"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: GpioStirrerParams = parse_params(DRIVER, params)?;
        params
            .pin
            .bcm_pin()
            .with_context(|| format!("stirrer pin {}", params.pin))?;
        Ok(())
    }

    fn resource_claims(&self, params: &toml::Value) -> Result<Vec<ResourceClaim>> {
        let params: GpioStirrerParams = parse_params(DRIVER, params)?;
        Ok(vec![params.pin.claim()?])
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: GpioStirrerParams = parse_params(DRIVER, &ctx.params)?;
            let output = open_output(&ctx, "stirrer", &params.pin).await?;
            info!(device_id = %ctx.device_id, pin = %params.pin, "GPIO stirrer ready");
            Ok(DeviceComponents::new()
                .with_stirrer(Arc::new(GpioStirrer::new(output)))
                .with_metadata(DeviceMetadata::default()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::SimulatedGpio;
    use microlab_core::gpio::GpioController;
    use std::collections::HashMap;

    #[tokio::test]
    async fn toggles_its_line() {
        let gpio = SimulatedGpio::new("gpio0");
        let mut controllers: HashMap<String, Arc<dyn GpioController>> = HashMap::new();
        controllers.insert("gpio0".into(), Arc::new(gpio.clone()));
        let params: toml::Value = toml::from_str("pin = { gpio_id = \"gpio0\", pin = 23 }").unwrap();

        let stirrer = GpioStirrerFactory
            .build(BuildContext::new("stirrer", params).with_gpio(Arc::new(controllers)))
            .await
            .unwrap()
            .stirrer
            .unwrap();

        stirrer.set_running(true).await.unwrap();
        assert!(stirrer.is_running());
        assert_eq!(gpio.level(23), Some(true));
        stirrer.set_running(false).await.unwrap();
        assert_eq!(gpio.level(23), Some(false));
    }

    #[tokio::test]
    async fn unknown_gpio_controller_fails_build() {
        let params: toml::Value = toml::from_str("pin = { gpio_id = \"nope\", pin = 23 }").unwrap();
        assert!(GpioStirrerFactory
            .build(BuildContext::new("stirrer", params))
            .await
            .is_err());
    }
}
