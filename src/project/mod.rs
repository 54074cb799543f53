//! Project Module
//!
//! Installed user projects: the workspace manifest, git checkouts and
//! virtual environments.

mod manager;
pub mod manifest;

pub use manager::ProjectManager;
