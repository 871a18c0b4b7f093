//! Recipe plans and the runner that walks them.
//!
//! A plan is a list of numbered steps. Each step shows a message and may
//! offer options, run a base task on one of the lab's devices, or mark the
//! recipe done. Steps are chained through `next` (or the chosen option's
//! `next`). Execution starts at the first step in the list.
//!
//! ```json
//! {
//!   "title": "Warm start",
//!   "steps": [
//!     {"nr": 0, "message": "Heating", "baseTask": "heat",
//!      "parameters": {"temp": 37}, "next": 1},
//!     {"nr": 1, "message": "Done", "done": true}
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use microlab_core::capabilities::ActuatorState;
use microlab_core::{DeviceType, LabError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_valid::Validate;
use thiserror::Error;
use tracing::{info, warn};

use crate::executor::TaskExecutor;
use crate::task::{TaskId, TaskState};

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("Invalid recipe plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid option {0}")]
    InvalidOption(String),

    #[error("Task already running")]
    TaskAlreadyRunning,

    #[error(transparent)]
    Lab(#[from] LabError),
}

// =============================================================================
// Plan
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum BaseTask {
    Heat,
    Cool,
    Maintain,
    MaintainHeat,
    MaintainCool,
    Pump,
    Stir,
    /// Waits for the operator; runs nothing.
    HumanTask,
}

/// The device role a base task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Dispenser,
    Stirrer,
}

impl Role {
    fn device_type(self) -> DeviceType {
        match self {
            Role::Controller => DeviceType::TemperatureController,
            Role::Dispenser => DeviceType::ReagentDispenser,
            Role::Stirrer => DeviceType::Stirrer,
        }
    }
}

impl BaseTask {
    /// Role and operation name, or `None` for `humanTask`.
    pub fn operation(self) -> Option<(Role, &'static str)> {
        let op = match self {
            BaseTask::Heat => (Role::Controller, "heat"),
            BaseTask::Cool => (Role::Controller, "cool"),
            BaseTask::Maintain => (Role::Controller, "maintain"),
            BaseTask::MaintainHeat => (Role::Controller, "maintainHeat"),
            BaseTask::MaintainCool => (Role::Controller, "maintainCool"),
            BaseTask::Pump => (Role::Dispenser, "pump"),
            BaseTask::Stir => (Role::Stirrer, "stir"),
            BaseTask::HumanTask => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RecipeOption {
    pub text: String,
    pub next: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecipeStep {
    pub nr: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<RecipeOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_task: Option<BaseTask>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub done: bool,
}

impl RecipeStep {
    /// The task this step submits, if any.
    fn task(&self) -> Option<(Role, &'static str)> {
        self.base_task.and_then(BaseTask::operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RecipePlan {
    pub title: String,
    pub steps: Vec<RecipeStep>,
}

impl RecipePlan {
    pub fn from_json(json: &str) -> Result<Self, RecipeError> {
        let plan: Self =
            serde_json::from_str(json).map_err(|e| RecipeError::InvalidPlan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self, RecipeError> {
        let json = std::fs::read_to_string(path).map_err(LabError::from)?;
        Self::from_json(&json)
    }

    /// Structural checks: unique step numbers, resolvable `next` targets,
    /// and every step has a way forward.
    pub fn validate(&self) -> Result<(), RecipeError> {
        let invalid = |msg: String| Err(RecipeError::InvalidPlan(msg));
        if self.steps.is_empty() {
            return invalid(format!("'{}' has no steps", self.title));
        }

        let mut numbers = HashSet::new();
        for step in &self.steps {
            if !numbers.insert(step.nr) {
                return invalid(format!("step number {} is used twice", step.nr));
            }
        }

        for step in &self.steps {
            let targets = step.next.iter().chain(step.options.iter().map(|o| &o.next));
            for target in targets {
                if !numbers.contains(target) {
                    return invalid(format!("step {} refers to missing step {}", step.nr, target));
                }
            }
            if !step.options.is_empty() && step.task().is_some() {
                return invalid(format!("step {} offers options and runs a task", step.nr));
            }
            if step.options.is_empty() && step.next.is_none() && !step.done {
                return invalid(format!("step {} has no next step and is not done", step.nr));
            }
            if step.task().is_some() && !step.parameters.is_object() {
                return invalid(format!("step {} needs a parameters object", step.nr));
            }
        }
        Ok(())
    }

    pub fn step(&self, nr: u32) -> Option<&RecipeStep> {
        self.steps.iter().find(|s| s.nr == nr)
    }

    fn first(&self) -> Option<u32> {
        self.steps.first().map(|s| s.nr)
    }
}

// =============================================================================
// Roles
// =============================================================================

fn default_controller() -> String {
    "ctrl".to_string()
}

fn default_dispenser() -> String {
    "pump".to_string()
}

fn default_stirrer() -> String {
    "stirrer".to_string()
}

/// `[recipe]` section: which devices base tasks run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RecipeRoles {
    #[serde(default = "default_controller")]
    #[validate(min_length = 1)]
    pub controller: String,
    #[serde(default = "default_dispenser")]
    #[validate(min_length = 1)]
    pub dispenser: String,
    #[serde(default = "default_stirrer")]
    #[validate(min_length = 1)]
    pub stirrer: String,
}

impl Default for RecipeRoles {
    fn default() -> Self {
        Self {
            controller: default_controller(),
            dispenser: default_dispenser(),
            stirrer: default_stirrer(),
        }
    }
}

impl RecipeRoles {
    pub fn device(&self, role: Role) -> &str {
        match role {
            Role::Controller => &self.controller,
            Role::Dispenser => &self.dispenser,
            Role::Stirrer => &self.stirrer,
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeState {
    #[default]
    Idle,
    Running,
    UserInput,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RecipeStatus {
    pub title: String,
    pub status: RecipeState,
    pub step: Option<u32>,
    pub message: String,
    pub options: Vec<String>,
    pub icon: Option<String>,
    /// The step's `time` parameter, if it has one.
    pub time: Option<Value>,
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
}

pub struct RecipeRunner {
    plan: RecipePlan,
    roles: RecipeRoles,
    executor: TaskExecutor,
    status: RecipeStatus,
}

impl RecipeRunner {
    /// Check the plan, and that every role it uses names a device of the
    /// right type.
    pub fn new(
        plan: RecipePlan,
        roles: RecipeRoles,
        executor: TaskExecutor,
    ) -> Result<Self, RecipeError> {
        plan.validate()?;
        let registry = executor.operations().registry();
        for step in &plan.steps {
            let Some((role, operation)) = step.task() else {
                continue;
            };
            let device_id = roles.device(role);
            let expected = role.device_type();
            if registry.device_type(device_id) != Some(expected) {
                return Err(RecipeError::InvalidPlan(format!(
                    "step {}: '{}' needs {} device '{}'",
                    step.nr, operation, expected, device_id
                )));
            }
        }
        let status = RecipeStatus {
            title: plan.title.clone(),
            ..Default::default()
        };
        Ok(Self {
            plan,
            roles,
            executor,
            status,
        })
    }

    pub fn status(&self) -> &RecipeStatus {
        &self.status
    }

    /// Run the first step.
    pub fn start(&mut self) -> Result<&RecipeStatus, RecipeError> {
        let first = self
            .plan
            .first()
            .ok_or_else(|| RecipeError::InvalidPlan("no steps".to_string()))?;
        info!(recipe = %self.plan.title, "recipe started");
        self.status.error = None;
        self.run_step(first)?;
        Ok(&self.status)
    }

    /// Poll the current task and advance when it has succeeded.
    pub fn update_status(&mut self) -> Result<&RecipeStatus, RecipeError> {
        if self.status.status != RecipeState::Running {
            return Ok(&self.status);
        }

        if let Some(id) = self.status.task_id {
            let task = self.executor.status(id)?;
            match task.state {
                TaskState::Succeeded => {}
                TaskState::Failed => {
                    let message = task
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "task failed".to_string());
                    warn!(recipe = %self.plan.title, step = ?self.status.step, error = %message, "recipe step failed");
                    self.status.status = RecipeState::Error;
                    self.status.error = Some(message);
                    return Ok(&self.status);
                }
                _ => return Ok(&self.status),
            }
        }

        let Some(step) = self.status.step.and_then(|nr| self.plan.step(nr)).cloned() else {
            return Ok(&self.status);
        };
        if step.done {
            self.complete();
        } else if let Some(next) = step.next {
            self.run_step(next)?;
        }
        Ok(&self.status)
    }

    /// Answer the current step's choice.
    pub fn select_option(&mut self, text: &str) -> Result<&RecipeStatus, RecipeError> {
        let next = self
            .status
            .step
            .and_then(|nr| self.plan.step(nr))
            .filter(|_| self.status.status == RecipeState::UserInput)
            .and_then(|step| step.options.iter().find(|o| o.text == text))
            .map(|o| o.next)
            .ok_or_else(|| RecipeError::InvalidOption(text.to_string()))?;
        self.run_step(next)?;
        Ok(&self.status)
    }

    /// Reset to idle. A queued task is cancelled, a running one is asked to
    /// stop, and the controller is idled if nothing else holds it.
    pub async fn stop(&mut self) -> Result<&RecipeStatus, RecipeError> {
        if let Some(id) = self.status.task_id.take() {
            self.executor.cancel(id)?;
        }

        let registry = self.executor.operations().registry();
        let controller_id = &self.roles.controller;
        if let Some(controller) = registry.temperature_controller(controller_id) {
            match registry.locks().try_acquire(controller_id) {
                Ok(_guard) => {
                    if let Err(err) = controller.apply(ActuatorState::Idle).await {
                        warn!(device_id = %controller_id, error = %err, "failed to idle controller on stop");
                    }
                }
                Err(_) => warn!(device_id = %controller_id, "controller busy, left as is on stop"),
            }
        }

        info!(recipe = %self.plan.title, "recipe stopped");
        self.status = RecipeStatus {
            title: self.plan.title.clone(),
            icon: self.status.icon.take(),
            ..Default::default()
        };
        Ok(&self.status)
    }

    /// Drive the recipe until it completes or fails, polling every `poll`.
    ///
    /// `choose` answers choice points; returning `None` stops the recipe.
    pub async fn run_to_end<F>(
        &mut self,
        poll: Duration,
        mut choose: F,
    ) -> Result<RecipeStatus, RecipeError>
    where
        F: FnMut(&RecipeStatus) -> Option<String>,
    {
        if self.status.status == RecipeState::Idle {
            self.start()?;
        }
        loop {
            match self.status.status {
                RecipeState::Complete | RecipeState::Error | RecipeState::Idle => {
                    return Ok(self.status.clone())
                }
                RecipeState::UserInput => match choose(&self.status) {
                    Some(choice) => {
                        self.select_option(&choice)?;
                    }
                    None => {
                        self.stop().await?;
                        return Ok(self.status.clone());
                    }
                },
                RecipeState::Running => {
                    tokio::time::sleep(poll).await;
                    self.update_status()?;
                }
            }
        }
    }

    fn complete(&mut self) {
        info!(recipe = %self.plan.title, "recipe complete");
        self.status.status = RecipeState::Complete;
        self.status.task_id = None;
        self.status.options.clear();
    }

    fn run_step(&mut self, nr: u32) -> Result<(), RecipeError> {
        let step = self
            .plan
            .step(nr)
            .cloned()
            .ok_or_else(|| RecipeError::InvalidPlan(format!("missing step {}", nr)))?;
        info!(recipe = %self.plan.title, step = nr, message = %step.message, "running recipe step");

        self.status.step = Some(nr);
        self.status.message = step.message.clone();
        self.status.options = step.options.iter().map(|o| o.text.clone()).collect();
        if step.icon.is_some() {
            self.status.icon = step.icon.clone();
        }
        self.status.time = step.parameters.get("time").cloned();
        self.status.status = if self.status.options.is_empty() {
            RecipeState::Running
        } else {
            RecipeState::UserInput
        };

        match step.task() {
            Some((role, operation)) => {
                if let Some(id) = self.status.task_id {
                    if !self.executor.status(id)?.state.is_terminal() {
                        self.status.status = RecipeState::Error;
                        self.status.error = Some(RecipeError::TaskAlreadyRunning.to_string());
                        return Err(RecipeError::TaskAlreadyRunning);
                    }
                }
                let device_id = self.roles.device(role).to_string();
                let id = self
                    .executor
                    .submit(device_id, operation, step.parameters.clone())?;
                self.status.task_id = Some(id);
            }
            None => {
                self.status.task_id = None;
                if step.done {
                    self.complete();
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RecipeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeRunner")
            .field("title", &self.plan.title)
            .field("status", &self.status.status)
            .finish()
    }
}
