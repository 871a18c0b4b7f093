//! Simulated syringe pump dispenser.
//!
//! Plans moves with the same calibration maths as the G-code driver and
//! sleeps for the planned duration (scaled by `time_scale`), so recipes and
//! tests see realistic timing without hardware.

use super::faults::{FaultConfig, FaultInjector};
use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use microlab_core::capabilities::{DispenseRequest, ReagentDispenser};
use microlab_core::driver::{
    parse_params, BuildContext, DeviceComponents, DeviceMetadata, DeviceType, DriverFactory,
};
use microlab_core::motion::{MotionPlan, SyringePumpAxisConfig};
use microlab_core::DeviceResult;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const DRIVER: &str = "simulated-dispenser";

fn default_axes() -> BTreeMap<String, SyringePumpAxisConfig> {
    let cfg = SyringePumpAxisConfig::new(0.8, 200, 3.5, 240.0);
    BTreeMap::from([("A".to_string(), cfg), ("B".to_string(), cfg)])
}

fn default_time_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
struct SimulatedDispenserParams {
    #[serde(default = "default_axes")]
    axes: BTreeMap<String, SyringePumpAxisConfig>,
    /// Multiplier on the planned duration; 0 completes moves immediately.
    #[serde(default = "default_time_scale")]
    time_scale: f64,
    #[serde(default)]
    faults: FaultConfig,
}

impl SimulatedDispenserParams {
    fn validate(&self) -> Result<()> {
        if self.axes.is_empty() {
            bail!("at least one axis must be configured");
        }
        for (axis, cfg) in &self.axes {
            cfg.check()
                .map_err(|e| anyhow::anyhow!("axis '{}': {}", axis, e))?;
        }
        if !self.time_scale.is_finite() || self.time_scale < 0.0 {
            bail!("time_scale must be a non-negative number");
        }
        self.faults.validate()
    }
}

pub struct SimulatedDispenser {
    axes: BTreeMap<String, SyringePumpAxisConfig>,
    time_scale: f64,
    dispensed: DashMap<String, f64>,
    faults: FaultInjector,
}

impl SimulatedDispenser {
    pub fn new(
        axes: BTreeMap<String, SyringePumpAxisConfig>,
        time_scale: f64,
        faults: FaultInjector,
    ) -> Self {
        Self {
            axes,
            time_scale,
            dispensed: DashMap::new(),
            faults,
        }
    }

    /// Two default axes (`A`, `B`) completing moves immediately.
    pub fn instant() -> Self {
        Self::new(default_axes(), 0.0, FaultInjector::none())
    }

    /// Total volume dispensed on an axis so far (ml).
    pub fn dispensed_ml(&self, axis: &str) -> f64 {
        self.dispensed.get(axis).map(|v| *v).unwrap_or(0.0)
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

#[async_trait]
impl ReagentDispenser for SimulatedDispenser {
    fn axes(&self) -> Vec<String> {
        self.axes.keys().cloned().collect()
    }

    fn axis_config(&self, axis: &str) -> Option<SyringePumpAxisConfig> {
        self.axes.get(axis).copied()
    }

    fn driver_name(&self) -> &'static str {
        DRIVER
    }

    async fn dispense(&self, request: DispenseRequest) -> DeviceResult<MotionPlan> {
        let plan = self.plan(&request)?;
        self.faults.check(DRIVER, "dispense")?;

        debug!(
            axis = %request.axis,
            volume_ml = request.volume_ml,
            steps = plan.steps,
            step_rate = plan.step_rate,
            clamped = plan.clamped,
            "simulated dispense"
        );
        if self.time_scale > 0.0 {
            tokio::time::sleep(plan.duration().mul_f64(self.time_scale)).await;
        }

        *self.dispensed.entry(request.axis).or_insert(0.0) += plan.volume_ml;
        Ok(plan)
    }
}

pub struct SimulatedDispenserFactory;

impl DriverFactory for SimulatedDispenserFactory {
    fn device_type(&self) -> DeviceType {
        DeviceType::ReagentDispenser
    }

    fn implementation(&self) -> &'static str {
        "simulated"
    }

    fn name(&self) -> &'static str {
        "Simulated Reagent Dispenser"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: SimulatedDispenserParams = parse_params(DRIVER, params)?;
        params.validate()
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: SimulatedDispenserParams = parse_params(DRIVER, &ctx.params)?;
            params.validate()?;
            let axes: Vec<String> = params.axes.keys().cloned().collect();
            let dispenser = Arc::new(SimulatedDispenser::new(
                params.axes,
                params.time_scale,
                FaultInjector::new(params.faults),
            ));
            Ok(DeviceComponents::new()
                .with_reagent_dispenser(dispenser)
                .with_metadata(DeviceMetadata {
                    axes,
                    simulated: true,
                    ..Default::default()
                }))
        })
    }
}
