//! # microlab
//!
//! Device orchestration and temperature control for a small bioreactor.
//!
//! The work is split across the workspace crates:
//!
//! - `microlab-core`: capability traits, errors, motion/unit conversion
//! - `microlab-hardware`: device config, dependency-ordered bring-up,
//!   real and simulated drivers
//! - `microlab-control`: the hysteresis control loop
//! - `microlab-tasks`: durable task execution and recipes
//!
//! This crate loads the lab file, sets up logging and wires the pieces into
//! a [`lab::Lab`].

pub mod config;
pub mod lab;
pub mod logging;

pub use config::LabConfig;
pub use lab::Lab;

pub use microlab_control as control;
pub use microlab_core as core;
pub use microlab_hardware as hardware;
pub use microlab_tasks as tasks;
