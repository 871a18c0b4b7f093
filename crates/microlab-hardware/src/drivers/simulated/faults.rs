//! Fault injection for simulated devices.
//!
//! Configured per device under `[devices.parameters.faults]`:
//!
//! ```toml
//! [devices.parameters.faults]
//! failure_rate = 0.1     # probability each operation fails
//! fail_after = 20        # every operation after the 20th fails
//! fail_always = false
//! kind = "timeout"       # communication | checksum | timeout | hardware
//! seed = 7               # reproducible failure_rate decisions
//! ```
//!
//! Tests can also switch failures on and off at runtime with
//! [`FaultInjector::set_failing`].

use microlab_core::{DeviceResult, DriverError, DriverErrorKind};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Failure kind injected into operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectedKind {
    #[default]
    Communication,
    Checksum,
    Timeout,
    Hardware,
}

impl From<InjectedKind> for DriverErrorKind {
    fn from(kind: InjectedKind) -> Self {
        match kind {
            InjectedKind::Communication => DriverErrorKind::Communication,
            InjectedKind::Checksum => DriverErrorKind::Checksum,
            InjectedKind::Timeout => DriverErrorKind::Timeout,
            InjectedKind::Hardware => DriverErrorKind::Hardware,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FaultConfig {
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default)]
    pub fail_after: Option<u64>,
    #[serde(default)]
    pub fail_always: bool,
    #[serde(default)]
    pub kind: InjectedKind,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl FaultConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            anyhow::bail!(
                "faults.failure_rate must be between 0 and 1 (got {})",
                self.failure_rate
            );
        }
        Ok(())
    }
}

/// Seeded RNG shared by a simulated device.
pub struct SimRng {
    inner: Mutex<ChaCha8Rng>,
}

impl SimRng {
    /// If seed is `None`, seeds from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    pub fn chance(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Uniform value in `[-amplitude, amplitude]`.
    pub fn jitter(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..=amplitude)
    }
}

impl std::fmt::Debug for SimRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}

/// Decides whether an operation of a simulated device fails.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultConfig,
    rng: SimRng,
    operations: AtomicU64,
    forced: AtomicBool,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        let rng = SimRng::new(config.seed);
        let forced = AtomicBool::new(config.fail_always);
        Self {
            config,
            rng,
            operations: AtomicU64::new(0),
            forced,
        }
    }

    pub fn none() -> Self {
        Self::new(FaultConfig::default())
    }

    /// Force every subsequent operation to fail (or stop forcing).
    pub fn set_failing(&self, failing: bool) {
        self.forced.store(failing, Ordering::SeqCst);
    }

    pub fn rng(&self) -> &SimRng {
        &self.rng
    }

    /// Check whether `operation` should fail.
    pub fn check(&self, driver: &str, operation: &str) -> DeviceResult<()> {
        let count = self.operations.fetch_add(1, Ordering::SeqCst) + 1;
        let kind: DriverErrorKind = self.config.kind.into();

        if self.forced.load(Ordering::SeqCst) {
            return Err(DriverError::new(
                driver,
                kind,
                format!("injected failure on '{}'", operation),
            ));
        }

        if let Some(limit) = self.config.fail_after {
            if count > limit {
                return Err(DriverError::new(
                    driver,
                    kind,
                    format!("injected failure after {} operations", limit),
                ));
            }
        }

        if self.rng.chance(self.config.failure_rate) {
            return Err(DriverError::new(
                driver,
                kind,
                format!("random failure on '{}'", operation),
            ));
        }

        Ok(())
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_faults_by_default() {
        let faults = FaultInjector::none();
        for _ in 0..100 {
            assert!(faults.check("sim", "read").is_ok());
        }
    }

    #[test]
    fn fail_after_n() {
        let faults = FaultInjector::new(FaultConfig {
            fail_after: Some(3),
            kind: InjectedKind::Timeout,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(faults.check("sim", "read").is_ok());
        }
        let err = faults.check("sim", "read").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(err.is_transient());
    }

    #[test]
    fn forced_failures_toggle() {
        let faults = FaultInjector::none();
        faults.set_failing(true);
        assert!(faults.check("sim", "read").is_err());
        faults.set_failing(false);
        assert!(faults.check("sim", "read").is_ok());
    }

    #[test]
    fn seeded_rate_is_reproducible() {
        let config = FaultConfig {
            failure_rate: 0.5,
            seed: Some(42),
            ..Default::default()
        };
        let a = FaultInjector::new(config.clone());
        let b = FaultInjector::new(config);
        let run = |f: &FaultInjector| -> Vec<bool> {
            (0..50).map(|_| f.check("sim", "read").is_ok()).collect()
        };
        assert_eq!(run(&a), run(&b));
    }

    #[test]
    fn rate_out_of_range_is_invalid() {
        let config = FaultConfig {
            failure_rate: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
