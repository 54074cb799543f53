//! Command infrastructure for the control plane
//!
//! This module handles:
//! - Serializing commands from every transport onto one worker
//! - Routing commands to handlers by endpoint name
//! - Turning handler outcomes into `(success, payload)` results

mod dispatcher;
pub mod handlers;
mod router;

pub use dispatcher::{CommandDispatcher, CommandHandler, PendingResult};
pub use handlers::HandlerContext;
pub use router::Router;
