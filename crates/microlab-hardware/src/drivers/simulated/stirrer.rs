use super::faults::{FaultConfig, FaultInjector};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use microlab_core::capabilities::Stirrer;
use microlab_core::driver::{
    parse_params, BuildContext, DeviceComponents, DeviceMetadata, DeviceType, DriverFactory,
};
use microlab_core::DeviceResult;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DRIVER: &str = "simulated-stirrer";

/// Stirrer that only remembers whether it is running.
#[derive(Default)]
pub struct SimulatedStirrer {
    running: AtomicBool,
    faults: FaultInjector,
}

impl SimulatedStirrer {
    pub fn new(faults: FaultInjector) -> Self {
        Self {
            running: AtomicBool::new(false),
            faults,
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

#[async_trait]
impl Stirrer for SimulatedStirrer {
    async fn set_running(&self, running: bool) -> DeviceResult<()> {
        self.faults.check(DRIVER, "set_running")?;
        self.running.store(running, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SimulatedStirrerParams {
    #[serde(default)]
    faults: FaultConfig,
}

pub struct SimulatedStirrerFactory;

impl DriverFactory for SimulatedStirrerFactory {
    fn device_type(&self) -> DeviceType {
        DeviceType::Stirrer
    }

    fn implementation(&self) -> &'static str {
        "simulated"
    }

    fn name(&self) -> &'static str {
        "Simulated Stirrer"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: SimulatedStirrerParams = parse_params(DRIVER, params)?;
        params.faults.validate()
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: SimulatedStirrerParams = parse_params(DRIVER, &ctx.params)?;
            Ok(DeviceComponents::new()
                .with_stirrer(Arc::new(SimulatedStirrer::new(FaultInjector::new(
                    params.faults,
                ))))
                .with_metadata(DeviceMetadata {
                    simulated: true,
                    ..Default::default()
                }))
        })
    }
}
