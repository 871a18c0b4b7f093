//! Per-device execution locks.
//!
//! One async mutex per device id, created once at bring-up. Whoever operates
//! a device (a task worker, the control loop) holds that device's guard for
//! the duration of the operation; dropping the guard releases it on every
//! exit path.

use microlab_core::{LabError, LabResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by device id. Cloning shares the table.
#[derive(Clone, Default)]
pub struct DeviceLocks {
    locks: Arc<HashMap<String, Arc<Mutex<()>>>>,
}

/// Proof of exclusive access to one device.
pub struct DeviceGuard {
    device_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceGuard {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl std::fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl DeviceLocks {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let locks = ids
            .into_iter()
            .map(|id| (id.into(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            locks: Arc::new(locks),
        }
    }

    fn lock_for(&self, device_id: &str) -> LabResult<Arc<Mutex<()>>> {
        self.locks
            .get(device_id)
            .cloned()
            .ok_or_else(|| LabError::UnknownDevice(device_id.to_string()))
    }

    /// Acquire without waiting.
    ///
    /// Fails with [`LabError::ResourceContention`] if another operation holds
    /// the device.
    pub fn try_acquire(&self, device_id: &str) -> LabResult<DeviceGuard> {
        let lock = self.lock_for(device_id)?;
        let guard = lock
            .try_lock_owned()
            .map_err(|_| LabError::ResourceContention {
                device_id: device_id.to_string(),
            })?;
        Ok(DeviceGuard {
            device_id: device_id.to_string(),
            _guard: guard,
        })
    }

    /// Acquire, waiting at most `timeout`.
    pub async fn acquire_timeout(
        &self,
        device_id: &str,
        timeout: Duration,
    ) -> LabResult<DeviceGuard> {
        let lock = self.lock_for(device_id)?;
        let guard = tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LabError::ResourceContention {
                device_id: device_id.to_string(),
            })?;
        Ok(DeviceGuard {
            device_id: device_id.to_string(),
            _guard: guard,
        })
    }

    pub fn is_locked(&self, device_id: &str) -> bool {
        self.locks
            .get(device_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.locks.contains_key(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_contention() {
        let locks = DeviceLocks::new(["pump"]);
        let guard = locks.try_acquire("pump").unwrap();
        assert!(locks.is_locked("pump"));
        assert!(matches!(
            locks.try_acquire("pump"),
            Err(LabError::ResourceContention { .. })
        ));
        drop(guard);
        assert!(!locks.is_locked("pump"));
        assert!(locks.try_acquire("pump").is_ok());
    }

    #[tokio::test]
    async fn unknown_device() {
        let locks = DeviceLocks::new(["pump"]);
        assert!(matches!(
            locks.try_acquire("nope"),
            Err(LabError::UnknownDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_waits_then_gives_up() {
        let locks = DeviceLocks::new(["ctrl"]);
        let _held = locks.try_acquire("ctrl").unwrap();
        let result = locks
            .acquire_timeout("ctrl", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(LabError::ResourceContention { .. })));
    }

    #[tokio::test]
    async fn clones_share_the_table() {
        let locks = DeviceLocks::new(["stirrer"]);
        let other = locks.clone();
        let _guard = locks.try_acquire("stirrer").unwrap();
        assert!(other.try_acquire("stirrer").is_err());
    }
}
