//! A running lab: registry, control loop and task executor wired from one
//! [`LabConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use microlab_control::{ControlHandle, ControlLoop};
use microlab_hardware::{DeviceRegistry, DriverCatalog};
use microlab_tasks::{OperationContext, RecipePlan, RecipeRunner, TaskExecutor};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::LabConfig;

pub struct Lab {
    config: LabConfig,
    registry: Arc<DeviceRegistry>,
    control: Option<ControlLoop>,
    control_handle: Option<ControlHandle>,
    executor: TaskExecutor,
}

impl Lab {
    /// Bring up every device, then build the control loop and the executor.
    ///
    /// Unfinished tasks from a previous run are re-queued here but do not run
    /// until [`Lab::start`].
    pub async fn bring_up(config: LabConfig) -> Result<Self> {
        Self::bring_up_with(config, &DriverCatalog::with_builtin_drivers()).await
    }

    /// As [`Lab::bring_up`], with a caller-supplied driver catalog.
    pub async fn bring_up_with(config: LabConfig, catalog: &DriverCatalog) -> Result<Self> {
        let registry = Arc::new(
            DeviceRegistry::bring_up(&config.hardware, catalog)
                .await
                .context("device bring-up failed")?,
        );

        let (control, control_handle) = match &config.control {
            Some(control) => {
                let (control, handle) = ControlLoop::new(&registry, control)
                    .context("control loop setup failed")?;
                (Some(control), Some(handle))
            }
            None => (None, None),
        };

        let mut ops = OperationContext::new(registry.clone());
        if let Some(handle) = &control_handle {
            ops = ops.with_control(handle.clone());
        }
        let executor = TaskExecutor::open(ops, &config.tasks).context("task store failed to open")?;

        info!(
            lab = %config.lab.name,
            devices = registry.list_devices().len(),
            control = control_handle.is_some(),
            "lab is up"
        );
        Ok(Self {
            config,
            registry,
            control,
            control_handle,
            executor,
        })
    }

    /// Spawn the control loop and the task workers.
    ///
    /// Everything stops when `shutdown` fires; await the returned handles to
    /// know the outputs were idled.
    pub fn start(&mut self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(control) = self.control.take() {
            handles.push(tokio::spawn(control.run(shutdown.subscribe())));
        }
        handles.extend(self.executor.start(shutdown));
        handles
    }

    /// A recipe runner using the configured `[recipe]` roles.
    pub fn recipe_runner(&self, plan: RecipePlan) -> Result<RecipeRunner> {
        Ok(RecipeRunner::new(
            plan,
            self.config.recipe.clone(),
            self.executor.clone(),
        )?)
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Handle on the control loop, if one is configured.
    pub fn control(&self) -> Option<&ControlHandle> {
        self.control_handle.as_ref()
    }
}

impl std::fmt::Debug for Lab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lab")
            .field("name", &self.config.lab.name)
            .field("devices", &self.registry.init_order())
            .field("control", &self.control_handle.is_some())
            .finish_non_exhaustive()
    }
}
