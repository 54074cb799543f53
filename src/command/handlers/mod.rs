//! Command handlers, grouped by the component they drive

mod devices;
mod execution;
mod project;

pub use devices::{handle_get_state, handle_get_states, handle_list_devices, handle_set_state};
pub use execution::{handle_execute_target, handle_stop_execution, handle_tinker};
pub use project::*;

use crate::devices::DeviceSynchronizer;
use crate::error::ProjectResult;
use crate::execution::ExecutionSupervisor;
use crate::project::ProjectManager;
use robot_link_shared::{CommandResult, Response};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

/// Components the handlers operate on
#[derive(Clone)]
pub struct HandlerContext {
    pub supervisor: Arc<ExecutionSupervisor>,
    pub devices: Arc<DeviceSynchronizer>,
    pub projects: Arc<ProjectManager>,
    /// Device model module inside a project directory
    pub model_file: String,
}

impl HandlerContext {
    /// Device model module of the selected project
    pub fn model_path(&self) -> ProjectResult<PathBuf> {
        Ok(self.projects.project_directory()?.join(&self.model_file))
    }
}

/// Failed result for a command missing its arguments
pub(crate) fn usage(text: &str) -> CommandResult {
    CommandResult::failed(format!("Invalid usage. Usage: {}", text))
}

/// Map a value-returning operation onto a result
pub(crate) fn reply<T, E>(result: Result<T, E>) -> CommandResult
where
    T: Into<Response>,
    E: Display,
{
    match result {
        Ok(value) => CommandResult::ok(value),
        Err(e) => CommandResult::failed(e.to_string()),
    }
}

/// Map an operation without a payload onto a result
pub(crate) fn done<E: Display>(result: Result<(), E>) -> CommandResult {
    match result {
        Ok(()) => CommandResult::done(),
        Err(e) => CommandResult::failed(e.to_string()),
    }
}
