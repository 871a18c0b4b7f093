//! In-memory GPIO controller.

use async_trait::async_trait;
use microlab_core::capabilities::DigitalOutput;
use microlab_core::gpio::GpioController;
use microlab_core::DeviceResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// GPIO controller that records physical line levels in memory.
#[derive(Clone)]
pub struct SimulatedGpio {
    id: String,
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

impl SimulatedGpio {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            levels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Physical level of a configured line (`true` = high).
    pub fn level(&self, bcm_pin: u8) -> Option<bool> {
        self.levels.lock().get(&bcm_pin).copied()
    }
}

#[async_trait]
impl GpioController for SimulatedGpio {
    fn id(&self) -> &str {
        &self.id
    }

    async fn output(&self, bcm_pin: u8, active_low: bool) -> DeviceResult<Arc<dyn DigitalOutput>> {
        self.levels.lock().insert(bcm_pin, active_low);
        Ok(Arc::new(SimulatedOutput {
            pin: bcm_pin,
            active_low,
            levels: self.levels.clone(),
            active: AtomicBool::new(false),
        }))
    }
}

struct SimulatedOutput {
    pin: u8,
    active_low: bool,
    levels: Arc<Mutex<HashMap<u8, bool>>>,
    active: AtomicBool,
}

#[async_trait]
impl DigitalOutput for SimulatedOutput {
    async fn set_active(&self, active: bool) -> DeviceResult<()> {
        self.levels.lock().insert(self.pin, active != self.active_low);
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

    #[tokio::test]
    async fn levels_follow_outputs() {
        let gpio = SimulatedGpio::new("gpio0");
        let out = gpio.output(17, false).await.unwrap();
        assert_eq!(gpio.level(17), Some(false));
        out.set_active(true).await.unwrap();
        assert_eq!(gpio.level(17), Some(true));
        assert!(out.is_active());
    }

    #[tokio::test]
    async fn active_low_inverts_level() {
        let gpio = SimulatedGpio::new("gpio0");
        let out = gpio.output(22, true).await.unwrap();
        assert_eq!(gpio.level(22), Some(true));
        out.set_active(true).await.unwrap();
        assert_eq!(gpio.level(22), Some(false));
    }
}
