//! Devices Module
//!
//! Loads a project's device model and keeps subscribers in sync with the
//! state of its devices.

pub mod model;
pub mod module;
pub mod sim;
mod synchronizer;

pub use model::ModelRegistry;
pub use synchronizer::DeviceSynchronizer;
