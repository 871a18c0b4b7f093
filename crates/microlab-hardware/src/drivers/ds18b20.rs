//! DS18B20 1-wire thermometer via the kernel w1 sysfs interface.
//!
//! The kernel exposes each sensor as `<base_path>/<sensor_id>/w1_slave`:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! The first line ends in `YES` when the scratchpad CRC matched; the second
//! carries the temperature in millidegrees Celsius. A reading of exactly
//! 85000 is the sensor's power-on reset value and means the conversion did
//! not complete.
//!
//! # Configuration
//!
//! ```toml
//! [[devices]]
//! id = "bath-thermometer"
//! type = "thermometer"
//! implementation = "ds18b20"
//! [devices.parameters]
//! sensor_id = "28-000005e2fdc3"
//! # base_path = "/sys/bus/w1/devices"
//! # timeout_ms = 2000
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use microlab_core::capabilities::Thermometer;
use microlab_core::driver::{
    parse_params, BuildContext, DeviceComponents, DeviceMetadata, DeviceType, DriverFactory,
    ResourceClaim,
};
use microlab_core::{DeviceResult, DriverError, DriverErrorKind};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DRIVER: &str = "ds18b20";
const POWER_ON_RESET_MILLIDEGREES: i64 = 85_000;

fn default_base_path() -> PathBuf {
    PathBuf::from("/sys/bus/w1/devices")
}

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
struct Ds18b20Params {
    sensor_id: String,
    #[serde(default = "default_base_path")]
    base_path: PathBuf,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

impl Ds18b20Params {
    fn validate(&self) -> Result<()> {
        if self.sensor_id.trim().is_empty() {
            bail!("sensor_id must not be empty");
        }
        if self.sensor_id.contains('/') {
            bail!("sensor_id '{}' must not contain '/'", self.sensor_id);
        }
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be greater than 0");
        }
        Ok(())
    }
}

/// Parse the contents of a `w1_slave` file into °C.
pub fn parse_w1_slave(contents: &str) -> DeviceResult<f64> {
    let mut lines = contents.lines();
    let crc_line = lines
        .next()
        .ok_or_else(|| DriverError::communication(DRIVER, "empty w1_slave output"))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(DriverError::new(
            DRIVER,
            DriverErrorKind::Checksum,
            format!("CRC check failed: '{}'", crc_line.trim()),
        ));
    }

    let data_line = lines
        .next()
        .ok_or_else(|| DriverError::communication(DRIVER, "missing temperature line"))?;
    let raw = data_line
        .rsplit_once("t=")
        .map(|(_, value)| value.trim())
        .ok_or_else(|| DriverError::communication(DRIVER, "no 't=' field in reading"))?;
    let millidegrees: i64 = raw.parse().map_err(|_| {
        DriverError::communication(DRIVER, format!("unparseable temperature '{}'", raw))
    })?;

    if millidegrees == POWER_ON_RESET_MILLIDEGREES {
        return Err(DriverError::communication(
            DRIVER,
            "power-on reset value (85 °C), conversion incomplete",
        ));
    }

    Ok(millidegrees as f64 / 1000.0)
}

pub struct Ds18b20 {
    sensor_id: String,
    slave_path: PathBuf,
    timeout: Duration,
}

impl Ds18b20 {
    pub fn new(sensor_id: impl Into<String>, base_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let sensor_id = sensor_id.into();
        let slave_path = base_path.into().join(&sensor_id).join("w1_slave");
        Self {
            sensor_id,
            slave_path,
            timeout,
        }
    }
}

#[async_trait]
impl Thermometer for Ds18b20 {
    async fn read_temperature(&self) -> DeviceResult<f64> {
        let contents = tokio::time::timeout(self.timeout, tokio::fs::read_to_string(&self.slave_path))
            .await
            .map_err(|_| {
                DriverError::timeout(
                    DRIVER,
                    format!("no reading from {} within {:?}", self.sensor_id, self.timeout),
                )
            })?
            .map_err(|e| DriverError::from_io(DRIVER, &format!("read sensor {}", self.sensor_id), &e))?;

        let celsius = parse_w1_slave(&contents)?;
        debug!(sensor_id = %self.sensor_id, celsius, "DS18B20 reading");
        Ok(celsius)
    }
}

pub struct Ds18b20Factory;

impl DriverFactory for Ds18b20Factory {
    fn device_type(&self) -> DeviceType {
        DeviceType::Thermometer
    }

    fn implementation(&self) -> &'static str {
        "ds18b20"
    }

    fn name(&self) -> &'static str {
        "DS18B20 1-Wire Thermometer"
    }

    fn validate(&self, params: &toml::Value) -> Result<()> {
        let params: Ds18b20Params = parse_params(DRIVER, params)?;
        params.validate()
    }

    fn resource_claims(&self, params: &toml::Value) -> Result<Vec<ResourceClaim>> {
        let params: Ds18b20Params = parse_params(DRIVER, params)?;
        Ok(vec![ResourceClaim::OneWireSensor(params.sensor_id)])
    }

    fn build(&self, ctx: BuildContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let params: Ds18b20Params = parse_params(DRIVER, &ctx.params)?;
            let sensor_dir = params.base_path.join(&params.sensor_id);
            let present = tokio::fs::try_exists(&sensor_dir)
                .await
                .with_context(|| format!("checking {}", sensor_dir.display()))?;
            if !present {
                bail!(
                    "1-wire sensor '{}' not found under {}",
                    params.sensor_id,
                    params.base_path.display()
                );
            }

            info!(device_id = %ctx.device_id, sensor_id = %params.sensor_id, "DS18B20 ready");
            let sensor = Ds18b20::new(
                params.sensor_id,
                params.base_path,
                Duration::from_millis(params.timeout_ms),
            );
            Ok(DeviceComponents::new()
                .with_thermometer(Arc::new(sensor))
                .with_metadata(DeviceMetadata {
                    measurement_units: Some("°C".to_string()),
                    ..Default::default()
                }))
        })
    }
}
