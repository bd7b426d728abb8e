//! DataBridge - composable data pipelines with scheduled, overlap-free execution
//!
//! A pipeline is a tree of [`command::Command`]s. Executing the root against a
//! [`parameters::ParameterSet`] yields a lazy stream of sets: each command's
//! output is fanned out depth-first through its children. A
//! [`scheduler::ScheduleService`] binds pipelines to schedules and makes sure a
//! pipeline never overlaps with its own previous run.

pub mod cli;
pub mod command;
pub mod commands;
pub mod condition;
pub mod daemon;
pub mod error;
pub mod execution;
pub mod logging;
pub mod metrics;
pub mod parameters;
pub mod pattern;
pub mod schedule;
pub mod scheduler;
pub mod settings;
pub mod timer;
