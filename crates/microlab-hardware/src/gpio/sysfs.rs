//! Linux sysfs GPIO controller (`/sys/class/gpio`).
//!
//! Exporting a line makes the kernel create `gpioN/`; udev may take a moment
//! to fix permissions on the new files, so the first `direction` write is
//! retried briefly.

use async_trait::async_trait;
use microlab_core::capabilities::DigitalOutput;
use microlab_core::gpio::GpioController;
use microlab_core::{DeviceResult, DriverError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DRIVER: &str = "gpio-sysfs";
const EXPORT_ATTEMPTS: u32 = 10;
const EXPORT_RETRY_DELAY: Duration = Duration::from_millis(50);

fn default_base_path() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SysfsParams {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
}

pub struct SysfsGpio {
    id: String,
    base: PathBuf,
}

impl SysfsGpio {
    pub fn new(id: impl Into<String>, base: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base: base.into(),
        }
    }

    fn line_dir(&self, bcm_pin: u8) -> PathBuf {
        self.base.join(format!("gpio{}", bcm_pin))
    }
}

async fn write_attr(path: &Path, value: &str) -> DeviceResult<()> {
    tokio::fs::write(path, value)
        .await
        .map_err(|e| DriverError::from_io(DRIVER, &format!("write {}", path.display()), &e))
}

#[async_trait]
impl GpioController for SysfsGpio {
    fn id(&self) -> &str {
        &self.id
    }

    async fn output(&self, bcm_pin: u8, active_low: bool) -> DeviceResult<Arc<dyn DigitalOutput>> {
        let dir = self.line_dir(bcm_pin);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!(gpio_id = %self.id, bcm_pin, "exporting GPIO line");
            write_attr(&self.base.join("export"), &bcm_pin.to_string()).await?;
        }

        let direction = dir.join("direction");
        let mut attempt = 0;
        loop {
            attempt += 1;
            match write_attr(&direction, "out").await {
                Ok(()) => break,
                Err(e) if attempt < EXPORT_ATTEMPTS => {
                    debug!(bcm_pin, attempt, error = %e, "direction not writable yet");
                    tokio::time::sleep(EXPORT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }

        let output = SysfsOutput {
            value_path: dir.join("value"),
            active_low,
            active: AtomicBool::new(false),
        };
        output.write_level(false).await?;
        Ok(Arc::new(output))
    }
}

struct SysfsOutput {
    value_path: PathBuf,
    active_low: bool,
    active: AtomicBool,
}

impl SysfsOutput {
    async fn write_level(&self, active: bool) -> DeviceResult<()> {
        let high = active != self.active_low;
        write_attr(&self.value_path, if high { "1" } else { "0" }).await
    }
}

#[async_trait]
impl DigitalOutput for SysfsOutput {
    async fn set_active(&self, active: bool) -> DeviceResult<()> {
        self.write_level(active).await?;
        self.active.store(active, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_line(base: &Path, pin: u8) {
        let dir = base.join(format!("gpio{pin}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("direction"), "in").unwrap();
        std::fs::write(dir.join("value"), "0").unwrap();
    }

    fn read(base: &Path, pin: u8, attr: &str) -> String {
        std::fs::read_to_string(base.join(format!("gpio{pin}")).join(attr)).unwrap()
    }

    #[tokio::test]
    async fn configures_and_drives_an_exported_line() {
        let tmp = tempfile::tempdir().unwrap();
        fake_line(tmp.path(), 17);
        let gpio = SysfsGpio::new("gpio0", tmp.path());

        let out = gpio.output(17, false).await.unwrap();
        assert_eq!(read(tmp.path(), 17, "direction"), "out");
        assert_eq!(read(tmp.path(), 17, "value"), "0");

        out.set_active(true).await.unwrap();
        assert_eq!(read(tmp.path(), 17, "value"), "1");
        assert!(out.is_active());
    }

    #[tokio::test]
    async fn active_low_line_idles_high() {
        let tmp = tempfile::tempdir().unwrap();
        fake_line(tmp.path(), 22);
        let gpio = SysfsGpio::new("gpio0", tmp.path());

        let out = gpio.output(22, true).await.unwrap();
        assert_eq!(read(tmp.path(), 22, "value"), "1");
        out.set_active(true).await.unwrap();
        assert_eq!(read(tmp.path(), 22, "value"), "0");
    }

    #[tokio::test]
    async fn missing_line_fails_after_export() {
        let tmp = tempfile::tempdir().unwrap();
        let gpio = SysfsGpio::new("gpio0", tmp.path());
        let err = gpio.output(5, false).await.err().unwrap();
        assert!(err.is_transient());
        assert_eq!(std::fs::read_to_string(tmp.path().join("export")).unwrap(), "5");
    }
}
