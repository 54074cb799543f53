//! Error kinds raised by the execution and device layers

use thiserror::Error;

/// Errors surfaced by the supervisor and the device synchronizer.
///
/// Every variant is recovered at the dispatcher boundary and reported to the
/// client as a failed result carrying the display text.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Failed to start program: {0}")]
    SpawnFailed(String),

    #[error("No robot loaded")]
    NoModelLoaded,

    #[error("No such file: {0}")]
    ModelFileNotFound(String),

    #[error("No device model found in {0}")]
    DeviceDefinitionNotFound(String),

    #[error("No device with UUID {id}. Found devices {known:?}")]
    DeviceNotFound { id: String, known: Vec<String> },

    #[error("Invalid state for {id}: {reason}")]
    InvalidState { id: String, reason: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors from workspace and project management
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("No projects installed")]
    NoProjects,

    #[error("Project not found")]
    ProjectNotFound,

    #[error("Project already installed")]
    AlreadyInstalled,

    #[error("No target set")]
    NoTarget,

    #[error("Failed to clone project")]
    CloneFailed,

    #[error("Failed to find targets")]
    NoTargets,

    #[error("{0} files are not yet supported")]
    Unsupported(String),

    /// A command failed; carries its error output
    #[error("{0}")]
    Command(String),

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ProjectResult<T> = Result<T, ProjectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_not_found_lists_known_ids() {
        let err = CoreError::DeviceNotFound {
            id: "claw".into(),
            known: vec!["arm".into(), "wheel".into()],
        };
        let text = err.to_string();
        assert!(text.contains("claw"));
        assert!(text.contains("\"arm\""));
        assert!(text.contains("\"wheel\""));
    }
}
