//! Transport trait abstraction for pluggable client-facing servers

use crate::command::CommandDispatcher;
use crate::devices::DeviceSynchronizer;
use crate::events::{DeviceNotifier, OutputSink};
use crate::execution::ExecutionSupervisor;
use crate::project::ProjectManager;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// What a transport needs from the rest of the process
#[derive(Clone)]
pub struct TransportContext {
    pub dispatcher: CommandDispatcher,
    /// Heartbeats bypass the dispatcher queue
    pub supervisor: Arc<ExecutionSupervisor>,
    pub devices: Arc<DeviceSynchronizer>,
    pub projects: Arc<ProjectManager>,
}

/// A server that accepts client commands and pushes events back.
///
/// Transports receive program output and device changes through the
/// [`OutputSink`] and [`DeviceNotifier`] supertraits.
#[async_trait]
pub trait Transport: OutputSink + DeviceNotifier + Send + Sync {
    /// Human-readable name for this transport
    fn name(&self) -> &'static str;

    /// Serve clients until the transport fails
    async fn serve(self: Arc<Self>) -> Result<()>;
}
