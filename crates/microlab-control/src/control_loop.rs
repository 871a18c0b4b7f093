//! Temperature Control Loop
//!
//! Periodic hysteresis control of one temperature controller.
//!
//! # Tick
//!
//! 1. Try to take the controller's and the thermometer's device locks. If a
//!    task holds either, the tick is skipped.
//! 2. Read the thermometer once.
//! 3. Decide against the controller's last applied state.
//! 4. Write the controller if the decision changed.
//!
//! A failed read holds the previous state. After `failure_threshold`
//! consecutive failures the outputs are forced idle and a fault is raised;
//! the first good read clears it.
//!
//! The target is optional. Without one the loop records samples and never
//! actuates, except that clearing a target returns the outputs to idle.

use crate::config::ControlLoopConfig;
use crate::state::{Evaluation, LoopState};
use microlab_core::capabilities::{ActuatorState, TemperatureController, Thermometer};
use microlab_core::thermal::ControlSample;
use microlab_core::{LabError, LabResult};
use microlab_hardware::{DeviceLocks, DeviceRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Snapshot published after every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlStatus {
    pub controller_id: String,
    pub thermometer_id: String,
    pub state: ActuatorState,
    pub target: Option<f64>,
    pub consecutive_failures: u32,
    pub faulted: bool,
    pub current: Option<ControlSample>,
    pub previous: Option<ControlSample>,
    pub skipped_ticks: u64,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A device lock was held elsewhere.
    Skipped,
    Completed(Evaluation),
}

// =============================================================================
// Control Handle
// =============================================================================

/// Sets the target and observes the loop. Cloning shares the loop.
#[derive(Clone)]
pub struct ControlHandle {
    target: Arc<watch::Sender<Option<f64>>>,
    status: watch::Receiver<ControlStatus>,
}

impl ControlHandle {
    pub fn set_target(&self, celsius: f64) -> LabResult<()> {
        if !celsius.is_finite() {
            return Err(LabError::InvalidParameters(format!(
                "target temperature must be finite (got {})",
                celsius
            )));
        }
        info!(target = celsius, "control target set");
        self.target.send_replace(Some(celsius));
        Ok(())
    }

    pub fn clear_target(&self) {
        info!("control target cleared");
        self.target.send_replace(None);
    }

    pub fn target(&self) -> Option<f64> {
        *self.target.borrow()
    }

    /// Latest published status.
    pub fn status(&self) -> ControlStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlStatus> {
        self.status.clone()
    }
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("target", &self.target())
            .finish()
    }
}

// =============================================================================
// Control Loop
// =============================================================================

pub struct ControlLoop {
    controller_id: String,
    thermometer_id: String,
    controller: Arc<dyn TemperatureController>,
    thermometer: Arc<dyn Thermometer>,
    locks: DeviceLocks,
    period: Duration,
    state: LoopState,
    target_rx: watch::Receiver<Option<f64>>,
    status_tx: watch::Sender<ControlStatus>,
    last_target: Option<f64>,
    skipped_ticks: u64,
}

impl ControlLoop {
    /// Resolve the controller and its thermometer from the registry.
    pub fn new(
        registry: &DeviceRegistry,
        config: &ControlLoopConfig,
    ) -> LabResult<(Self, ControlHandle)> {
        let controller = registry.require_temperature_controller(&config.controller)?;
        let thermometer_id = controller.thermometer_id().to_string();
        let thermometer = registry.require_thermometer(&thermometer_id)?;

        let (target_tx, target_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(ControlStatus {
            controller_id: config.controller.clone(),
            thermometer_id: thermometer_id.clone(),
            ..Default::default()
        });
        let handle = ControlHandle {
            target: Arc::new(target_tx),
            status: status_rx,
        };
        if let Some(target) = config.target {
            handle.set_target(target)?;
        }

        let control = Self {
            controller_id: config.controller.clone(),
            thermometer_id,
            controller,
            thermometer,
            locks: registry.locks().clone(),
            period: config.period(),
            state: LoopState::new(config.failure_threshold),
            target_rx,
            status_tx,
            last_target: None,
            skipped_ticks: 0,
        };
        Ok((control, handle))
    }

    /// Run one tick.
    pub async fn tick(&mut self) -> TickOutcome {
        let target = *self.target_rx.borrow_and_update();

        let Some(_controller_guard) = self.try_lock(&self.controller_id) else {
            return self.skip(target);
        };
        let Some(thermometer_guard) = self.try_lock(&self.thermometer_id) else {
            return self.skip(target);
        };

        let reading = match self.thermometer.read_temperature().await {
            Ok(celsius) => Some(celsius),
            Err(e) => {
                warn!(
                    thermometer = %self.thermometer_id,
                    consecutive_failures = self.state.consecutive_failures() + 1,
                    error = %e,
                    "temperature read failed"
                );
                None
            }
        };
        drop(thermometer_guard);

        let applied = self.controller.state();
        let mut evaluation =
            self.state
                .evaluate(reading, applied, target, self.controller.deadband());

        let target_cleared = self.last_target.is_some() && target.is_none();
        if target_cleared && applied != ActuatorState::Idle && evaluation.command.is_none() {
            evaluation.command = Some(ActuatorState::Idle);
        }
        self.last_target = target;

        if evaluation.fault_raised {
            error!(
                controller = %self.controller_id,
                thermometer = %self.thermometer_id,
                consecutive_failures = self.state.consecutive_failures(),
                "temperature control fault: thermometer unreadable, outputs forced idle"
            );
        }
        if evaluation.fault_cleared {
            info!(controller = %self.controller_id, "temperature control fault cleared");
        }

        if let Some(command) = evaluation.command {
            match self.controller.apply(command).await {
                Ok(()) => info!(
                    controller = %self.controller_id,
                    from = %applied,
                    to = %command,
                    temperature = ?reading,
                    target = ?target,
                    "actuator state changed"
                ),
                Err(e) => error!(
                    controller = %self.controller_id,
                    command = %command,
                    error = %e,
                    "actuator write failed"
                ),
            }
        }

        self.publish(target);
        TickOutcome::Completed(evaluation)
    }

    /// Tick every period until `shutdown` fires, then leave the outputs idle.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            controller = %self.controller_id,
            thermometer = %self.thermometer_id,
            period_ms = self.period.as_millis() as u64,
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.shutdown().await;
        info!(controller = %self.controller_id, "control loop stopped");
    }

    async fn shutdown(&mut self) {
        if self.controller.state() == ActuatorState::Idle {
            return;
        }
        match self.locks.acquire_timeout(&self.controller_id, self.period).await {
            Ok(_guard) => {
                if let Err(e) = self.controller.apply(ActuatorState::Idle).await {
                    error!(controller = %self.controller_id, error = %e, "failed to idle outputs on shutdown");
                }
            }
            Err(e) => warn!(controller = %self.controller_id, error = %e, "outputs left to the task holding the controller"),
        }
    }

    fn try_lock(&self, device_id: &str) -> Option<microlab_hardware::DeviceGuard> {
        match self.locks.try_acquire(device_id) {
            Ok(guard) => Some(guard),
            Err(e) => {
                debug!(device_id, error = %e, "control tick skipped");
                None
            }
        }
    }

    fn skip(&mut self, target: Option<f64>) -> TickOutcome {
        self.skipped_ticks += 1;
        self.publish(target);
        TickOutcome::Skipped
    }

    fn publish(&self, target: Option<f64>) {
        let status = ControlStatus {
            controller_id: self.controller_id.clone(),
            thermometer_id: self.thermometer_id.clone(),
            state: self.controller.state(),
            target,
            consecutive_failures: self.state.consecutive_failures(),
            faulted: self.state.is_faulted(),
            current: self.state.current(),
            previous: self.state.previous(),
            skipped_ticks: self.skipped_ticks,
        };
        self.status_tx.send_replace(status);
    }
}
