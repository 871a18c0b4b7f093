//! `microlab-tasks`
//!
//! Durable task execution for the microlab core.
//!
//! - [`store`]: redb-backed task records, committed before `submit` returns
//! - [`executor`]: the worker pool, per-device locking, retries and
//!   cancellation
//! - [`operations`]: what each device type can be asked to do
//! - [`recipe`]: step-by-step recipe plans run on top of the executor

pub mod config;
pub mod executor;
pub mod operations;
pub mod recipe;
pub mod store;
pub mod task;

pub use config::TaskConfig;
pub use executor::TaskExecutor;
pub use operations::{Operation, OperationContext};
pub use recipe::{RecipeError, RecipePlan, RecipeRoles, RecipeRunner, RecipeState, RecipeStatus};
pub use store::TaskDb;
pub use task::{TaskError, TaskId, TaskRecord, TaskState, TaskStatus};
