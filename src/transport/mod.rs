//! Client-facing transports
//!
//! Every transport decodes client requests into commands for the shared
//! dispatcher and pushes program output and device changes back to its
//! clients.

pub mod ble;
pub mod traits;
pub mod websocket;

pub use ble::BleTransport;
pub use traits::{Transport, TransportContext};
pub use websocket::WebSocketTransport;

use crate::devices::DeviceSynchronizer;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Device ids reported changed, waiting for their state to be fetched.
///
/// The notifier callback is synchronous while state lookups are not, so
/// transports queue ids here and resolve them on their own task.
pub(crate) struct ChangeFeed {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn push(&self, device_id: &str) {
        let _ = self.tx.send(device_id.to_string());
    }

    /// The receiving end; only the first caller gets it
    pub fn take(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve queued device ids to states and hand them to `emit`
pub(crate) async fn pump_changes<F>(
    mut rx: mpsc::UnboundedReceiver<String>,
    devices: Arc<DeviceSynchronizer>,
    emit: F,
) where
    F: Fn(&str, Value),
{
    while let Some(id) = rx.recv().await {
        match devices.state_of(&id).await {
            Ok(state) => emit(&id, state),
            // The model may have been swapped since the change was queued
            Err(e) => debug!("[TRANSPORT] Dropping update for {}: {}", id, e),
        }
    }
}
